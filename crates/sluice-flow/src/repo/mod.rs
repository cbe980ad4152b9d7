//! Context persistence.
//!
//! Nodes checkpoint every batch they touch; the retry path relies on
//! `update_status` writing a whole batch or nothing.

mod memory;
mod sqlite;

pub use memory::MemoryContextRepository;
pub use sqlite::SqliteContextRepository;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::config::StoreConfig;
use sluice_core::error::Result;
use sluice_core::status::FlowNodeStatus;
use sluice_core::types::ContextId;

use crate::context::{ContextRecord, FlowContext};

pub trait ContextRepository<T>: Send + Sync {
    /// Insert new contexts. Existing rows are replaced.
    fn save(&self, contexts: &[FlowContext<T>]) -> Result<()>;

    /// Write the full current state of every context.
    fn update(&self, contexts: &[FlowContext<T>]) -> Result<()>;

    /// Write `status` and `position` for the whole batch.
    fn update_status(
        &self,
        contexts: &[FlowContext<T>],
        status: FlowNodeStatus,
        position: &str,
    ) -> Result<()>;

    fn get(&self, id: &ContextId) -> Result<Option<ContextRecord<T>>>;

    fn find_by_status(&self, status: FlowNodeStatus) -> Result<Vec<ContextRecord<T>>>;
}

/// SQLite when a store path is configured, memory otherwise.
pub fn open_repository<T>(config: &StoreConfig) -> Result<Arc<dyn ContextRepository<T>>>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match config.resolved_path() {
        Some(path) => Ok(Arc::new(SqliteContextRepository::open(&path)?)),
        None => Ok(Arc::new(MemoryContextRepository::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FlowSession;

    #[test]
    fn test_open_memory_by_default() {
        let repo = open_repository::<String>(&StoreConfig::default()).unwrap();
        let ctx = FlowContext::new(FlowSession::new(), "a".to_string(), "n");
        repo.save(std::slice::from_ref(&ctx)).unwrap();
        assert!(repo.get(ctx.id()).unwrap().is_some());
    }

    #[test]
    fn test_open_sqlite_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: Some(dir.path().join("contexts.db").to_string_lossy().into_owned()),
        };
        let repo = open_repository::<String>(&config).unwrap();
        let ctx = FlowContext::new(FlowSession::new(), "a".to_string(), "n");
        repo.save(std::slice::from_ref(&ctx)).unwrap();

        assert!(dir.path().join("contexts.db").exists());
        assert_eq!(repo.get(ctx.id()).unwrap().unwrap().data, "a");
    }
}
