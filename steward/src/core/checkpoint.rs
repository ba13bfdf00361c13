//! Run checkpoint: the durable state machine behind crash recovery.
//!
//! An item moves `pending → in_flight → completed` exactly once; the only
//! way back out of `in_flight` without completing is the crash-recovery
//! path on the next run. `in_flight` and `completed` stay disjoint through
//! every transition, and serialization uses ordered collections so files
//! diff cleanly and recovery walks items in stable order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use primitive_types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Decision, Verdict};

/// A submission that succeeded but whose attestation has not yet been
/// acknowledged by the ledger. Carries everything needed to retry the
/// attestation without touching the execution surface again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttestation {
    pub submission_reference: String,
    pub submission_digest: H256,
    pub verdict: Verdict,
    pub choice: u8,
    pub decision_digest: H256,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointViolation {
    #[error("item {0} is already completed")]
    AlreadyCompleted(String),
    #[error("item {0} is not in flight")]
    NotInFlight(String),
}

/// Durable progress for one source key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunCheckpoint {
    pub source_key: String,
    /// Items being decided or submitted whose outcome is not yet durable.
    /// Written before any side effect, cleared only on completion.
    pub in_flight: BTreeSet<String>,
    /// Items that reached a terminal state; never re-decided.
    pub completed: BTreeSet<String>,
    /// Decisions made but not yet fully processed, keyed by item id.
    /// Lets recovery attest a submission that landed just before a crash.
    pub decisions: BTreeMap<String, Decision>,
    /// Submissions awaiting a successful ledger write.
    pub pending_attestations: BTreeMap<String, PendingAttestation>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
}

impl RunCheckpoint {
    pub fn new(source_key: &str) -> Self {
        Self {
            source_key: source_key.to_string(),
            ..Self::default()
        }
    }

    /// A start stamp newer than the finish stamp means the previous run
    /// never ran its shutdown sequence.
    pub fn unclean_shutdown(&self) -> bool {
        match (self.last_run_started_at, self.last_run_finished_at) {
            (Some(started), Some(finished)) => started > finished,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Move an item into `in_flight`. Must precede every side effect for
    /// that item.
    pub fn begin_item(&mut self, item_id: &str) -> Result<(), CheckpointViolation> {
        if self.completed.contains(item_id) {
            return Err(CheckpointViolation::AlreadyCompleted(item_id.to_string()));
        }
        self.in_flight.insert(item_id.to_string());
        Ok(())
    }

    /// Record the engine's decision for an in-flight item, ahead of the
    /// execution-surface call.
    pub fn record_decision(&mut self, decision: &Decision) -> Result<(), CheckpointViolation> {
        if !self.in_flight.contains(&decision.item_id) {
            return Err(CheckpointViolation::NotInFlight(decision.item_id.clone()));
        }
        self.decisions.insert(decision.item_id.clone(), decision.clone());
        Ok(())
    }

    /// Record a confirmed submission awaiting attestation. The stored
    /// decision is folded into the pending entry and dropped.
    pub fn record_submission(
        &mut self,
        item_id: &str,
        pending: PendingAttestation,
    ) -> Result<(), CheckpointViolation> {
        if !self.in_flight.contains(item_id) {
            return Err(CheckpointViolation::NotInFlight(item_id.to_string()));
        }
        self.decisions.remove(item_id);
        self.pending_attestations.insert(item_id.to_string(), pending);
        Ok(())
    }

    /// Move an item from `in_flight` to `completed` (any terminal state).
    pub fn complete_item(&mut self, item_id: &str) -> Result<(), CheckpointViolation> {
        if !self.in_flight.remove(item_id) {
            return Err(CheckpointViolation::NotInFlight(item_id.to_string()));
        }
        self.decisions.remove(item_id);
        self.pending_attestations.remove(item_id);
        self.completed.insert(item_id.to_string());
        Ok(())
    }

    /// Crash-recovery only: return an in-flight item to the candidate pool
    /// after establishing that no submission ever landed for it.
    pub fn abandon_in_flight(&mut self, item_id: &str) -> Result<(), CheckpointViolation> {
        if !self.in_flight.remove(item_id) {
            return Err(CheckpointViolation::NotInFlight(item_id.to_string()));
        }
        self.decisions.remove(item_id);
        self.pending_attestations.remove(item_id);
        Ok(())
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.last_run_started_at = Some(now);
    }

    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        self.last_run_finished_at = Some(now);
    }

    /// The invariant every transition preserves: in-flight and completed
    /// are disjoint, and auxiliary maps only describe in-flight items.
    pub fn is_consistent(&self) -> bool {
        self.in_flight.is_disjoint(&self.completed)
            && self.decisions.keys().all(|id| self.in_flight.contains(id))
            && self
                .pending_attestations
                .keys()
                .all(|id| self.in_flight.contains(id))
    }
}
