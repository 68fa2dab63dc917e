//! missiond - autonomous mission orchestrator
//!
//! Library components for the `missiond` binary: persistence, the step
//! executor, the execution loop, and the lifecycle controller.

pub mod execution;
pub mod executor;
pub mod orchestrator;
pub mod render;
pub mod state;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use mission_core::Config;
use storage::{Storage, StorageError};

pub use executor::{StepError, StepExecutor, StepHandler};
pub use orchestrator::{Orchestrator, OrchestratorError};

/// Get the default database path (~/.local/share/missiond/missiond.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
                .unwrap_or_else(|| PathBuf::from("."))
        });
    data_dir.join("missiond").join("missiond.db")
}

/// Open the configured database and apply migrations.
pub async fn open_storage(config: &Config) -> Result<Arc<Storage>, StorageError> {
    let db_path = config.db_path.clone().unwrap_or_else(default_db_path);
    let storage = Storage::new(&db_path).await?;
    storage.migrate_embedded().await?;
    Ok(Arc::new(storage))
}
