//! Detection of obvious host memory over-commit.
//!
//! This is not a quota system: it only refuses to start an instance when
//! the memory already promised to running instances plus the new request
//! exceeds the host's physical memory.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::plan::InstanceId;
use crate::record::InstanceState;
use crate::registry::RecordSet;

const KIB_PER_MIB: u64 = 1024;

/// Source of the host's total memory.
pub trait HostCapacity: Send + Sync {
    /// Total physical memory in MiB, or `None` when it cannot be determined.
    fn total_memory_mb(&self) -> Option<u64>;
}

/// Reads `MemTotal` from a Linux `meminfo` file.
#[derive(Clone, Debug)]
pub struct ProcMeminfo {
    path: Utf8PathBuf,
}

impl ProcMeminfo {
    /// Uses the given `meminfo` file.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new("/proc/meminfo")
    }
}

impl HostCapacity for ProcMeminfo {
    fn total_memory_mb(&self) -> Option<u64> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("/"));
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).ok()?;
        let contents = dir.read_to_string(self.path.file_name()?).ok()?;
        parse_mem_total(&contents)
    }
}

/// Capacity fixed up front; `None` disables the check.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FixedCapacity(pub Option<u64>);

impl HostCapacity for FixedCapacity {
    fn total_memory_mb(&self) -> Option<u64> {
        self.0
    }
}

/// A request that would exceed the host's memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Overcommit {
    /// Memory the new instance asks for, in MiB.
    pub requested_mb: u64,
    /// Memory already held by other live instances, in MiB.
    pub committed_mb: u64,
    /// Host total, in MiB.
    pub total_mb: u64,
}

/// Memory held by live instances other than `exclude`.
#[must_use]
pub fn committed_memory_mb(records: &RecordSet, exclude: &InstanceId) -> u64 {
    records
        .iter()
        .filter(|record| &record.id != exclude)
        .filter(|record| {
            matches!(
                record.state,
                InstanceState::Running
                    | InstanceState::Provisioning
                    | InstanceState::Creating
                    | InstanceState::Starting
            )
        })
        .map(|record| u64::from(record.resources.memory_mb))
        .sum()
}

/// Returns the over-commit, if starting `requested_mb` more would exceed
/// the host's memory. Unknown capacity never blocks.
#[must_use]
pub fn assess(capacity: &dyn HostCapacity, committed_mb: u64, requested_mb: u64) -> Option<Overcommit> {
    let total_mb = capacity.total_memory_mb()?;
    (committed_mb.saturating_add(requested_mb) > total_mb).then_some(Overcommit {
        requested_mb,
        committed_mb,
        total_mb,
    })
}

fn parse_mem_total(contents: &str) -> Option<u64> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("MemTotal:"))?;
    let kib = line
        .split_whitespace()
        .nth(1)
        .and_then(|value| value.parse::<u64>().ok())?;
    kib.checked_div(KIB_PER_MIB)
}
