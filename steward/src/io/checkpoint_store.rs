//! Durable checkpoint persistence, one JSON file per source key.
//!
//! Saves are atomic (temp file + rename) so a reader never observes a
//! partially written checkpoint, and idempotent under retry. Access is
//! serialized per key; the store being unreachable is fatal to a run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::checkpoint::RunCheckpoint;

pub struct CheckpointStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Load the checkpoint for `source_key`, or a fresh default if none has
    /// been saved yet. A present-but-unreadable file is an error, not a
    /// default: silently restarting from scratch would re-decide items.
    pub fn load(&self, source_key: &str) -> Result<RunCheckpoint> {
        let path = self.path_for(source_key)?;
        let lock = self.lock_for(source_key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !path.exists() {
            debug!(source_key, "no checkpoint on disk, starting fresh");
            return Ok(RunCheckpoint::new(source_key));
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let checkpoint: RunCheckpoint = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        debug!(
            source_key,
            in_flight = checkpoint.in_flight.len(),
            completed = checkpoint.completed.len(),
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Atomically persist a checkpoint (temp file + rename).
    pub fn save(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.source_key)?;
        let lock = self.lock_for(&checkpoint.source_key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn path_for(&self, source_key: &str) -> Result<PathBuf> {
        validate_source_key(source_key)?;
        Ok(self.dir.join(format!("{source_key}.json")))
    }

    fn lock_for(&self, source_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(source_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Source keys become file names, so restrict them to a safe charset.
fn validate_source_key(source_key: &str) -> Result<()> {
    let valid = !source_key.is_empty()
        && source_key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if !valid {
        return Err(anyhow!(
            "invalid source key {source_key:?}: expected [A-Za-z0-9._-]+"
        ));
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}
