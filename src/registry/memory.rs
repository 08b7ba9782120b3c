//! In-process registry used by tests and embedders.

use std::sync::{Arc, Mutex, PoisonError};

use super::{RecordSet, Registry};
use crate::record::InstanceRecord;

/// Registry kept in memory behind a mutex.
///
/// Clones share the same records, so a test can hand one clone to the
/// lifecycle and inspect another afterwards.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    records: Arc<Mutex<RecordSet>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = InstanceRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(RecordSet::from_records(records))),
        }
    }
}

impl Registry for MemoryRegistry {
    fn transact<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut RecordSet) -> Result<T, E>,
        E: From<super::RegistryError>,
    {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = guard.clone();
        working.mark_clean();
        let outcome = operation(&mut working)?;
        if working.is_dirty() {
            working.mark_clean();
            *guard = working;
        }
        Ok(outcome)
    }
}
