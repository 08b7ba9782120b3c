//! Reading of flat `KEY=value` project declaration files.
//!
//! Parsing is deliberately lenient about layout (comments, blank lines,
//! `export` prefixes, quoted values) and strict about shape: a line that is
//! not a key/value pair is recorded as a [`LineIssue`] so the validator can
//! report it next to every other problem instead of stopping early.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// A line of the declaration file that could not be read as `KEY=value`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineIssue {
    /// One-based line number.
    pub line: usize,
    /// Human-readable description of the problem.
    pub message: String,
}

/// Raw, unvalidated key/value declarations for one project.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawConfig {
    entries: BTreeMap<String, String>,
    issues: Vec<LineIssue>,
    duplicates: Vec<String>,
}

/// Errors raised while reading a declaration file from disk.
#[derive(Debug, Error)]
pub enum EnvFileError {
    /// Raised when the declaration file does not exist.
    #[error("configuration file {path} not found")]
    NotFound {
        /// Path that was looked up.
        path: Utf8PathBuf,
    },
    /// Raised when the file exists but cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl RawConfig {
    /// Parses declaration text.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (index, raw_line) in text.lines().enumerate() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let line = trimmed
                .strip_prefix("export ")
                .map_or(trimmed, str::trim_start);

            let Some((raw_key, value)) = line.split_once('=') else {
                config.issues.push(LineIssue {
                    line: index + 1,
                    message: format!("expected KEY=value, got '{line}'"),
                });
                continue;
            };

            let key = raw_key.trim();
            if key.is_empty() {
                config.issues.push(LineIssue {
                    line: index + 1,
                    message: String::from("missing key before '='"),
                });
                continue;
            }

            config.insert(key, unquote(value.trim()));
        }
        config
    }

    /// Builds a configuration from explicit pairs, mainly for tests and
    /// programmatic callers.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.insert(key.as_ref().trim(), value.as_ref().trim());
        }
        config
    }

    /// Reads and parses the declaration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvFileError::NotFound`] when the file is missing and
    /// [`EnvFileError::Io`] for any other read failure.
    pub fn load(path: &Utf8Path) -> Result<Self, EnvFileError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let Some(file_name) = path.file_name() else {
            return Err(EnvFileError::Io {
                path: path.to_path_buf(),
                message: String::from("path has no file name"),
            });
        };

        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| classify_io(path, &err))?;
        let text = dir
            .read_to_string(file_name)
            .map_err(|err| classify_io(path, &err))?;
        Ok(Self::parse(&text))
    }

    /// Returns the value declared for `key`, if any. Empty values count as
    /// absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Iterates over the declared keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Lines that could not be parsed.
    #[must_use]
    pub fn issues(&self) -> &[LineIssue] {
        &self.issues
    }

    /// Keys that were declared more than once; the last value wins.
    #[must_use]
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    fn insert(&mut self, key: &str, value: &str) {
        if self
            .entries
            .insert(key.to_owned(), value.to_owned())
            .is_some()
            && !self.duplicates.iter().any(|seen| seen == key)
        {
            self.duplicates.push(key.to_owned());
        }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn classify_io(path: &Utf8Path, err: &io::Error) -> EnvFileError {
    if err.kind() == io::ErrorKind::NotFound {
        EnvFileError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        EnvFileError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
