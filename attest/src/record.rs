//! The durable proof-of-decision record.

use chrono::{DateTime, Utc};
use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};

/// One signed, ledger-accepted proof that a decision was made and acted on.
///
/// Constructed once after the execution surface confirmed the submission,
/// signed once, written once. Never updated or revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub signer_address: H160,
    pub item_id: String,
    pub source_key: String,
    /// Verdict as its canonical lowercase name (e.g. `approve`).
    pub verdict: String,
    /// Numeric choice as encoded in the attested payload.
    pub choice: u8,
    /// Hash of the decision that produced this attestation.
    pub decision_digest: H256,
    /// Opaque reference returned by the execution surface.
    pub submission_reference: String,
    pub created_at: DateTime<Utc>,
}
