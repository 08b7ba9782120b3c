//! Filesystem lookups needed by the validator.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Answers whether a path names a readable regular file.
///
/// This is the only side channel the validator uses; tests substitute an
/// in-memory set of paths.
pub trait FileProbe {
    /// Returns `true` when `path` exists, is a regular file and can be
    /// opened for reading.
    fn is_readable_file(&self, path: &Utf8Path) -> bool;
}

/// Probe backed by the host filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct AmbientFiles;

impl FileProbe for AmbientFiles {
    fn is_readable_file(&self, path: &Utf8Path) -> bool {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let Some(file_name) = path.file_name() else {
            return false;
        };
        let Ok(dir) = Dir::open_ambient_dir(parent, ambient_authority()) else {
            return false;
        };
        dir.open(file_name)
            .and_then(|file| file.metadata())
            .is_ok_and(|metadata| metadata.is_file())
    }
}

impl FileProbe for BTreeSet<Utf8PathBuf> {
    fn is_readable_file(&self, path: &Utf8Path) -> bool {
        self.contains(path)
    }
}
