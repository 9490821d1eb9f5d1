//! Durable per-unit context store
//!
//! Every processing unit owns one directory below the store root holding a single
//! JSON record: `<root>/<context id>/eventInfo.data`. The directory is the unit of
//! existence, an absent directory means the unit is unknown.

use core::error::Error;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use derive_more::Display;
use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::pu_management::ContextId;

const RECORD_FILE: &str = "eventInfo.data";
const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

pub type ContextStoreResult<T> = Result<T, Report<ContextStoreError>>;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ContextStoreError {
    #[display("Unknown context id {context_id}")]
    NotFound { context_id: String },

    #[display("Failed to read context {context_id}")]
    Read { context_id: String },

    #[display("Failed to write context {context_id}")]
    Write { context_id: String },

    #[display("Invalid state found for context {context_id}")]
    Corrupt { context_id: String },

    #[display("Failed to remove context {context_id}")]
    Remove { context_id: String },

    #[display("Context store at {path} is not available")]
    Unavailable { path: String },
}

impl Error for ContextStoreError {}

/// File hierarchy backed store of persisted unit records
#[derive(Debug, Clone)]
pub struct ContextStore {
    root: PathBuf,
}

impl ContextStore {
    /// Open the store rooted at `root`, creating the directory when missing.
    pub fn open(root: impl Into<PathBuf>) -> ContextStoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(&root)
                .change_context(ContextStoreError::Unavailable {
                    path: root.display().to_string(),
                })?;
            info!(path = %root.display(), "Created context store directory");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `record` for `context_id`, replacing any existing record.
    pub fn store<T: Serialize>(&self, context_id: &ContextId, record: &T) -> ContextStoreResult<()> {
        let write_error = || ContextStoreError::Write {
            context_id: context_id.to_string(),
        };

        let folder = self.folder(context_id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&folder)
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("directory: {}", folder.display()))?;

        let data = serde_json::to_vec(record).change_context_lazy(write_error)?;

        let path = folder.join(RECORD_FILE);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)
            .change_context_lazy(write_error)
            .attach_printable_lazy(|| format!("file: {}", path.display()))?;
        file.write_all(&data).change_context_lazy(write_error)?;

        debug!(context_id = %context_id, "Stored context record");
        Ok(())
    }

    /// Read the record of `context_id`.
    ///
    /// A record that cannot be decoded is removed from the store before the error
    /// is returned, so the next read reports [`ContextStoreError::NotFound`].
    pub fn get<T: DeserializeOwned>(&self, context_id: &ContextId) -> ContextStoreResult<T> {
        let folder = self.folder(context_id);
        if !folder.is_dir() {
            return Err(Report::new(ContextStoreError::NotFound {
                context_id: context_id.to_string(),
            }));
        }

        let data = fs::read(folder.join(RECORD_FILE)).change_context(ContextStoreError::Read {
            context_id: context_id.to_string(),
        })?;

        match serde_json::from_slice(&data) {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(
                    context_id = %context_id,
                    error = %err,
                    "Found invalid state for context, cleaning up"
                );
                let report = Report::new(err).change_context(ContextStoreError::Corrupt {
                    context_id: context_id.to_string(),
                });
                match self.remove(context_id) {
                    Ok(()) => Err(report),
                    Err(remove_err) => {
                        Err(remove_err.attach_printable(format!("while cleaning up: {report:?}")))
                    }
                }
            }
        }
    }

    /// Delete the record of `context_id` together with its directory.
    pub fn remove(&self, context_id: &ContextId) -> ContextStoreResult<()> {
        let folder = self.folder(context_id);
        if !folder.is_dir() {
            return Err(Report::new(ContextStoreError::NotFound {
                context_id: context_id.to_string(),
            }));
        }

        fs::remove_dir_all(&folder).change_context(ContextStoreError::Remove {
            context_id: context_id.to_string(),
        })?;

        debug!(context_id = %context_id, "Removed context record");
        Ok(())
    }

    /// Iterate over the ids of all stored contexts.
    ///
    /// The directory listing is read lazily, entries created while walking may or
    /// may not show up.
    pub fn walk(&self) -> ContextStoreResult<StoreWalker> {
        let entries = fs::read_dir(&self.root).change_context(ContextStoreError::Unavailable {
            path: self.root.display().to_string(),
        })?;
        Ok(StoreWalker { entries })
    }

    /// Remove the whole store hierarchy.
    pub fn destroy(&self) -> ContextStoreResult<()> {
        let unavailable = || ContextStoreError::Unavailable {
            path: self.root.display().to_string(),
        };
        if !self.root.is_dir() {
            return Err(Report::new(unavailable()).attach_printable("store not initialized"));
        }
        fs::remove_dir_all(&self.root).change_context_lazy(unavailable)?;

        info!(path = %self.root.display(), "Destroyed context store");
        Ok(())
    }

    fn folder(&self, context_id: &ContextId) -> PathBuf {
        self.root.join(context_id.as_str())
    }
}

/// Lazy listing of stored context ids
#[derive(Debug)]
pub struct StoreWalker {
    entries: fs::ReadDir,
}

impl Iterator for StoreWalker {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "Failed to read context store entry");
                    continue;
                }
            };
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                debug!(path = %entry.path().display(), "Skipping non-directory store entry");
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => return Some(name),
                Err(name) => {
                    warn!(name = ?name, "Skipping non UTF-8 store entry");
                }
            }
        }
        None
    }
}

/// `true` when the report means the context simply does not exist
pub fn is_not_found(report: &Report<ContextStoreError>) -> bool {
    matches!(report.current_context(), ContextStoreError::NotFound { .. })
}
