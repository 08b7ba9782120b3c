//! JSON registry document guarded by a sibling lock file.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RecordSet, Registry, RegistryError};
use crate::plan::InstanceId;
use crate::record::InstanceRecord;

const DOCUMENT_VERSION: u32 = 1;

/// How long to wait for, and when to break, the registry lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockPolicy {
    /// Give up acquiring after this long.
    pub timeout: Duration,
    /// Treat a lock older than this as left behind by a dead process.
    pub stale_after: Duration,
    /// Delay between acquisition attempts.
    pub retry_every: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(120),
            retry_every: Duration::from_millis(50),
        }
    }
}

/// Registry persisted as a single JSON document on disk.
///
/// Writers take an exclusive `<file>.lock` created with create-new
/// semantics, read the document, apply the transaction and replace the
/// document through a temporary file and rename. A lock older than the
/// policy's stale window is moved aside before it is deleted, and put back
/// if it changed in the meantime.
#[derive(Clone, Debug)]
pub struct FileRegistry {
    path: Utf8PathBuf,
    policy: LockPolicy,
}

#[derive(Debug, Deserialize, Serialize)]
struct Document {
    version: u32,
    #[serde(default)]
    instances: BTreeMap<InstanceId, InstanceRecord>,
}

impl FileRegistry {
    /// Opens (lazily) the registry stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, policy: LockPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    /// Location of the registry document.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn file_name(&self) -> Result<&str, RegistryError> {
        self.path.file_name().ok_or_else(|| RegistryError::Io {
            path: self.path.clone(),
            message: String::from("registry path is missing a file name"),
        })
    }

    fn open_dir(&self) -> Result<Dir, RegistryError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(parent, ambient_authority()))
            .map_err(|err| RegistryError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            })
    }

    fn read(&self, dir: &Dir, file_name: &str) -> Result<RecordSet, RegistryError> {
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RecordSet::default()),
            Err(err) => return Err(self.io_error(&err)),
        };
        if contents.trim().is_empty() {
            return Ok(RecordSet::default());
        }

        let document: Document =
            serde_json::from_str(&contents).map_err(|err| self.corrupt(err.to_string()))?;
        if document.version != DOCUMENT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported registry version {}",
                document.version
            )));
        }
        if let Some((key, record)) = document
            .instances
            .iter()
            .find(|(key, record)| **key != record.id)
        {
            return Err(self.corrupt(format!(
                "entry {key} holds a record for {}",
                record.id
            )));
        }
        Ok(RecordSet::from_records(document.instances.into_values()))
    }

    fn write(&self, dir: &Dir, file_name: &str, set: RecordSet) -> Result<(), RegistryError> {
        let document = Document {
            version: DOCUMENT_VERSION,
            instances: set.into_records(),
        };
        let mut bytes = serde_json::to_vec_pretty(&document).map_err(|err| RegistryError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        bytes.push(b'\n');

        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
        let staged = dir.create(&temp_name).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(err) = staged.and_then(|()| dir.rename(&temp_name, dir, file_name)) {
            if let Err(cleanup) = dir.remove_file(&temp_name) {
                debug!(file = %temp_name, error = %cleanup, "temporary registry file not removed");
            }
            return Err(self.io_error(&err));
        }
        Ok(())
    }

    fn corrupt(&self, message: String) -> RegistryError {
        RegistryError::Corrupt {
            path: self.path.clone(),
            message,
        }
    }

    fn io_error(&self, err: &io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

impl Registry for FileRegistry {
    fn transact<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut RecordSet) -> Result<T, E>,
        E: From<RegistryError>,
    {
        off_async_worker(|| -> Result<T, E> {
            let file_name = self.file_name()?;
            let dir = self.open_dir()?;
            let lock_name = format!("{file_name}.lock");
            let lock_path = self.path.with_file_name(&lock_name);
            let _lock = LockGuard::acquire(&dir, &lock_name, lock_path, self.policy)?;

            let mut set = self.read(&dir, file_name)?;
            let outcome = operation(&mut set)?;
            if set.is_dirty() {
                self.write(&dir, file_name, set)?;
            }
            Ok(outcome)
        })
    }
}

/// Runs blocking registry I/O without stalling a multi-threaded runtime.
///
/// On a tokio worker the closure runs under `block_in_place`, so other tasks
/// move to another worker while the lock is polled.
fn off_async_worker<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

struct LockGuard<'dir> {
    dir: &'dir Dir,
    name: &'dir str,
    token: String,
}

impl<'dir> LockGuard<'dir> {
    fn acquire(
        dir: &'dir Dir,
        name: &'dir str,
        display_path: Utf8PathBuf,
        policy: LockPolicy,
    ) -> Result<Self, RegistryError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        loop {
            match dir.open_with(name, &options) {
                Ok(mut file) => {
                    let stamp = format!(
                        "{token} {} {}\n",
                        Utc::now().to_rfc3339(),
                        std::process::id()
                    );
                    if let Err(err) = file.write_all(stamp.as_bytes()) {
                        if let Err(remove_err) = dir.remove_file(name) {
                            warn!(lock = %display_path, error = %remove_err, "half-written lock left behind");
                        }
                        return Err(RegistryError::Io {
                            path: display_path,
                            message: err.to_string(),
                        });
                    }
                    debug!(lock = %display_path, "registry lock acquired");
                    return Ok(Self { dir, name, token });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = stale_contents(dir, name, policy.stale_after) {
                        warn!(lock = %display_path, "breaking stale registry lock");
                        if break_stale_lock(dir, name, &observed) {
                            continue;
                        }
                    }
                    if started.elapsed() >= policy.timeout {
                        return Err(RegistryError::LockTimeout {
                            path: display_path,
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    thread::sleep(policy.retry_every);
                }
                Err(err) => {
                    return Err(RegistryError::Io {
                        path: display_path,
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let still_ours = self
            .dir
            .read_to_string(self.name)
            .is_ok_and(|contents| contents.starts_with(&self.token));
        if !still_ours {
            warn!(lock = self.name, "registry lock was taken over before release");
            return;
        }
        if let Err(err) = self.dir.remove_file(self.name) {
            warn!(lock = self.name, error = %err, "failed to release registry lock");
        }
    }
}

/// Returns the lock contents when they name an acquisition older than
/// `stale_after`.
fn stale_contents(dir: &Dir, name: &str, stale_after: Duration) -> Option<String> {
    let contents = dir.read_to_string(name).ok()?;
    let acquired = contents
        .split_whitespace()
        .nth(1)
        .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())?;
    let limit = chrono::Duration::from_std(stale_after).ok()?;
    (Utc::now().signed_duration_since(acquired.with_timezone(&Utc)) > limit).then_some(contents)
}

/// Removes the lock only if it still holds `observed`.
///
/// The lock is first renamed to a private name so that a fresh lock created
/// after the staleness check is never deleted. A lock that turns out to be
/// fresh is linked back into place. Returns `true` when the caller may retry
/// creating the lock straight away.
pub(super) fn break_stale_lock(dir: &Dir, name: &str, observed: &str) -> bool {
    let aside = format!("{name}.{}.stale", Uuid::new_v4().simple());
    match dir.rename(name, dir, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
        Err(err) => {
            debug!(lock = name, error = %err, "stale lock not moved aside");
            return false;
        }
    }

    let still_stale = dir
        .read_to_string(&aside)
        .is_ok_and(|contents| contents == observed);
    if !still_stale {
        match dir.hard_link(&aside, dir, name) {
            Ok(()) => debug!(lock = name, "fresh lock restored after stale check"),
            Err(err) => warn!(lock = name, error = %err, "fresh lock could not be restored"),
        }
    }
    if let Err(err) = dir.remove_file(&aside) {
        warn!(file = %aside, error = %err, "moved lock file not removed");
    }
    still_stale
}
