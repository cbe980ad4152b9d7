use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sluice_core::error::Result;
use sluice_core::status::FlowNodeStatus;
use sluice_core::types::ContextId;

use super::ContextRepository;
use crate::context::{ContextRecord, FlowContext};

/// Process-local repository. One lock covers the whole map, so every batch
/// write is atomic.
pub struct MemoryContextRepository<T> {
    records: Mutex<HashMap<ContextId, ContextRecord<T>>>,
}

impl<T> MemoryContextRepository<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ContextId, ContextRecord<T>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

impl<T> Default for MemoryContextRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> ContextRepository<T> for MemoryContextRepository<T> {
    fn save(&self, contexts: &[FlowContext<T>]) -> Result<()> {
        self.update(contexts)
    }

    fn update(&self, contexts: &[FlowContext<T>]) -> Result<()> {
        let mut records = self.records();
        for ctx in contexts {
            records.insert(ctx.id().clone(), ctx.to_record());
        }
        Ok(())
    }

    fn update_status(
        &self,
        contexts: &[FlowContext<T>],
        status: FlowNodeStatus,
        position: &str,
    ) -> Result<()> {
        let mut records = self.records();
        for ctx in contexts {
            let record = records
                .entry(ctx.id().clone())
                .or_insert_with(|| ctx.to_record());
            record.status = status;
            record.position = position.to_string();
            record.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    fn get(&self, id: &ContextId) -> Result<Option<ContextRecord<T>>> {
        Ok(self.records().get(id).cloned())
    }

    fn find_by_status(&self, status: FlowNodeStatus) -> Result<Vec<ContextRecord<T>>> {
        let mut found: Vec<_> = self
            .records()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}
