//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between core components and across
//! checkpoint files. They must stay deterministic and I/O-free; persisted
//! shapes evolve additively only.

use primitive_types::H256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome the decision engine assigns to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    Abstain,
    NoAction,
}

impl Verdict {
    /// Whether this verdict results in a submission. `NoAction` is the
    /// policy "do nothing" verdict; a reject is still acted upon.
    pub fn is_actionable(self) -> bool {
        !matches!(self, Verdict::NoAction)
    }

    /// Numeric choice as encoded in the attestation payload.
    pub fn choice(self) -> Option<u8> {
        match self {
            Verdict::Approve => Some(1),
            Verdict::Reject => Some(2),
            Verdict::Abstain => Some(3),
            Verdict::NoAction => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Reject => "reject",
            Verdict::Abstain => "abstain",
            Verdict::NoAction => "no_action",
        }
    }

    /// Inverse of [`Verdict::choice`], used when rebuilding state from a
    /// recorded submission.
    pub fn from_choice(choice: u8) -> Option<Self> {
        match choice {
            1 => Some(Verdict::Approve),
            2 => Some(Verdict::Reject),
            3 => Some(Verdict::Abstain),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work from the proposal feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub item_id: String,
    /// Where the item came from (e.g. the proposing address); allow/deny
    /// filtering applies to this field.
    pub origin: String,
    /// Feed-specific body, passed through to the decision engine.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Decision engine output for one item. Immutable once produced; a later
/// run supersedes it with a new decision rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub item_id: String,
    pub verdict: Verdict,
    /// Engine confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    pub rationale: String,
    pub strategy_applied: String,
}

impl Decision {
    /// SHA-256 over the canonical JSON encoding.
    pub fn digest(&self) -> serde_json::Result<H256> {
        let bytes = serde_json::to_vec(self)?;
        Ok(H256(Sha256::digest(&bytes).into()))
    }
}

/// Phase in which an item failed or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPhase {
    Filter,
    Decide,
    Submit,
    Attest,
}

impl std::fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemPhase::Filter => "filter",
            ItemPhase::Decide => "decide",
            ItemPhase::Submit => "submit",
            ItemPhase::Attest => "attest",
        };
        f.write_str(name)
    }
}

/// Per-item failure detail surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub phase: ItemPhase,
    pub reason: String,
}

/// Aggregated outcome of one `run()` invocation.
///
/// Individual item failures land in `errors`; only feed or checkpoint
/// store unavailability aborts a run without producing a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub source_key: String,
    /// Items for which the engine produced a decision this run.
    pub decided: u32,
    /// Items submitted to the execution surface and attested.
    pub submitted: u32,
    /// Items skipped by policy (origin filter, low confidence, no-action).
    pub skipped: u32,
    /// Items completed without side effects because of dry-run mode.
    pub simulated: u32,
    pub errors: Vec<ItemFailure>,
}

impl RunSummary {
    pub fn new(source_key: &str) -> Self {
        Self {
            source_key: source_key.to_string(),
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, item_id: &str, phase: ItemPhase, reason: impl Into<String>) {
        self.errors.push(ItemFailure {
            item_id: item_id.to_string(),
            phase,
            reason: reason.into(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
