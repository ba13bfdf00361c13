//! Candidate selection: cheap filters that run before the decision engine.
//!
//! Order matters for cost: already-completed items are dropped first, then
//! the origin policy, then the per-run cap. Feed order is preserved so runs
//! are deterministic for a given feed snapshot.

use std::collections::BTreeSet;

use regex::Regex;

use crate::core::types::PendingItem;

/// Allow/deny origin filtering compiled from config patterns.
///
/// Deny wins over allow; an empty allow list permits every origin that is
/// not denied.
#[derive(Debug, Default, Clone)]
pub struct OriginPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl OriginPolicy {
    pub fn from_patterns(allow: &[String], deny: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    pub fn permits(&self, origin: &str) -> bool {
        if self.deny.iter().any(|pattern| pattern.is_match(origin)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|pattern| pattern.is_match(origin))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|pattern| Regex::new(pattern)).collect()
}

/// Result of candidate selection.
#[derive(Debug)]
pub struct Selection {
    /// Items to run the decision engine on, in feed order.
    pub candidates: Vec<PendingItem>,
    /// Item ids excluded by the origin policy this run.
    pub denied: Vec<String>,
    /// Number of eligible items dropped by the per-run cap.
    pub truncated: usize,
}

/// Select candidates from a feed snapshot.
///
/// `excluded` holds ids that must not be re-decided: completed items and
/// anything still in flight awaiting recovery.
pub fn select_candidates(
    items: Vec<PendingItem>,
    excluded: &BTreeSet<String>,
    policy: &OriginPolicy,
    max_items: usize,
) -> Selection {
    let mut candidates = Vec::new();
    let mut denied = Vec::new();
    let mut truncated = 0usize;

    for item in items {
        if excluded.contains(&item.item_id) {
            continue;
        }
        if !policy.permits(&item.origin) {
            denied.push(item.item_id);
            continue;
        }
        if candidates.len() < max_items {
            candidates.push(item);
        } else {
            truncated += 1;
        }
    }

    Selection {
        candidates,
        denied,
        truncated,
    }
}
