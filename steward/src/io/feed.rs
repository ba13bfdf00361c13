//! Proposal source: where pending items come from.
//!
//! The feed transport (HTTP client, pagination, query language) is an
//! external collaborator; [`ProposalSource`] is the contract the run
//! coordinator consumes. [`FileFeed`] is the production drop point: an
//! upstream fetcher writes `<dir>/<source_key>.json` and the agent reads
//! it, which keeps `list_pending` idempotent within a run window.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::core::types::PendingItem;
use crate::io::retry::CallError;

/// Contract for listing pending items of one source key.
///
/// Implementations may return fewer items than exist; they must be
/// idempotent for the same key within a short window.
pub trait ProposalSource {
    fn list_pending(&self, source_key: &str) -> Result<Vec<PendingItem>, CallError>;
}

impl<T: ProposalSource + ?Sized> ProposalSource for &T {
    fn list_pending(&self, source_key: &str) -> Result<Vec<PendingItem>, CallError> {
        (**self).list_pending(source_key)
    }
}

/// Reads pending items from a JSON file per source key.
pub struct FileFeed {
    dir: PathBuf,
}

impl FileFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ProposalSource for FileFeed {
    fn list_pending(&self, source_key: &str) -> Result<Vec<PendingItem>, CallError> {
        let path = self.dir.join(format!("{source_key}.json"));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(source_key, path = %path.display(), "no feed file, nothing pending");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(CallError::Transient(format!(
                    "read feed {}: {err}",
                    path.display()
                )));
            }
        };
        let items: Vec<PendingItem> = serde_json::from_str(&contents).map_err(|err| {
            CallError::Permanent(format!("parse feed {}: {err}", path.display()))
        })?;
        debug!(source_key, count = items.len(), "feed listed pending items");
        Ok(items)
    }
}
