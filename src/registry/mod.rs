//! Durable store of instance records shared by every project on the host.
//!
//! All access goes through [`Registry::transact`], which hands the caller
//! an exclusive, mutable [`RecordSet`] and persists it only when the
//! closure succeeds and actually changed something. The convenience
//! methods (`get`, `upsert`, `remove`, `all`) are thin wrappers over it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::plan::{InstanceId, Protocol};
use crate::record::InstanceRecord;

mod file;
mod memory;

pub use file::{FileRegistry, LockPolicy};
pub use memory::MemoryRegistry;

/// Errors raised by registry implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// The persisted document could not be understood. It is left untouched
    /// for manual inspection.
    #[error("registry {path} is corrupt: {message}")]
    Corrupt {
        /// Location of the registry document.
        path: Utf8PathBuf,
        /// Parser or consistency error.
        message: String,
    },
    /// Reading or writing the registry failed.
    #[error("failed to access registry {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Another process held the registry lock for too long.
    #[error("timed out after {waited_secs}s waiting for registry lock {path}")]
    LockTimeout {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Seconds spent waiting.
        waited_secs: u64,
    },
    /// An upsert mutation returned a record for a different key.
    #[error("upsert for {expected} produced a record for {found}")]
    IdMismatch {
        /// Key being updated.
        expected: InstanceId,
        /// Key of the returned record.
        found: InstanceId,
    },
}

/// The registry's records as seen inside one transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<InstanceId, InstanceRecord>,
    dirty: bool,
}

impl RecordSet {
    /// Builds a set from existing records, keyed by their ids.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = InstanceRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            dirty: false,
        }
    }

    /// Looks up a record.
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&InstanceRecord> {
        self.records.get(id)
    }

    /// Inserts or replaces a record, returning the previous value.
    pub fn insert(&mut self, record: InstanceRecord) -> Option<InstanceRecord> {
        self.dirty = true;
        self.records.insert(record.id.clone(), record)
    }

    /// Removes a record, returning it if it existed.
    pub fn remove(&mut self, id: &InstanceId) -> Option<InstanceRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Iterates over records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.values()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index of bound host ports to the instance that owns them.
    #[must_use]
    pub fn port_owners(&self) -> BTreeMap<(u16, Protocol), InstanceId> {
        self.iter()
            .flat_map(|record| {
                record
                    .networking
                    .ports
                    .iter()
                    .map(move |binding| ((binding.host, binding.protocol), record.id.clone()))
            })
            .collect()
    }

    /// Index of fixed IP addresses to the instance that owns them.
    #[must_use]
    pub fn ip_owners(&self) -> BTreeMap<Ipv4Addr, InstanceId> {
        self.iter()
            .filter_map(|record| {
                record
                    .networking
                    .fixed_ip
                    .map(|ip| (ip, record.id.clone()))
            })
            .collect()
    }

    pub(crate) const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) const fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn into_records(self) -> BTreeMap<InstanceId, InstanceRecord> {
        self.records
    }
}

/// A durable, process-shared map of instance records.
///
/// Implementations must make [`Registry::transact`] atomic with respect to
/// every other transaction on the same store, including those issued by
/// other processes.
pub trait Registry {
    /// Runs `operation` against an exclusive view of the records.
    ///
    /// Changes are persisted only when `operation` returns `Ok` and modified
    /// the set; an `Err` discards them.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a [`RegistryError`] (converted into
    /// `E`) when the store cannot be locked, read or written.
    fn transact<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut RecordSet) -> Result<T, E>,
        E: From<RegistryError>;

    /// Returns a point-in-time copy of every record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn snapshot(&self) -> Result<RecordSet, RegistryError> {
        self.transact(|set| {
            let mut copy = set.clone();
            copy.mark_clean();
            Ok(copy)
        })
    }

    /// Returns the record for `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, RegistryError> {
        self.transact(|set| Ok(set.get(id).cloned()))
    }

    /// Returns every record in id order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read.
    fn all(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        self.transact(|set| Ok(set.iter().cloned().collect()))
    }

    /// Atomically reads the record for `id`, applies `mutation` and writes
    /// the result back.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdMismatch`] when the mutation changes the
    /// record's id, or any storage error.
    fn upsert<F>(&self, id: &InstanceId, mutation: F) -> Result<InstanceRecord, RegistryError>
    where
        F: FnOnce(Option<&InstanceRecord>) -> InstanceRecord,
    {
        self.transact(|set| {
            let next = mutation(set.get(id));
            if next.id != *id {
                return Err(RegistryError::IdMismatch {
                    expected: id.clone(),
                    found: next.id,
                });
            }
            set.insert(next.clone());
            Ok(next)
        })
    }

    /// Removes the record for `id`, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the store cannot be read or written.
    fn remove(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, RegistryError> {
        self.transact(|set| Ok(set.remove(id)))
    }
}

#[cfg(test)]
mod tests;
