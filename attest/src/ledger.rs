//! The append-only verifying ledger the counter forwards into.
//!
//! The real ledger is an on-chain contract; [`Ledger`] is its call surface
//! and [`InMemoryLedger`] is a full verifying implementation used by tests
//! and local runs. Rejections are typed so callers can distinguish a bad
//! signature from an unknown schema from an expired deadline.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::{H160, H256};
use thiserror::Error;

use crate::signer::{Signature, recover};
use crate::typed_data::{DelegatedAttestation, Eip712Domain, encode_u64, keccak256};

/// A delegated attestation together with the signature authorizing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDelegatedAttestation {
    pub message: DelegatedAttestation,
    pub signature: Signature,
}

/// Why the ledger rejected a request. Reasons travel unmodified through the
/// counter so submitters can branch on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid signature: recovered {recovered:?}, attester {attester:?}")]
    InvalidSignature { recovered: H160, attester: H160 },
    #[error("deadline expired: deadline {deadline}, now {now}")]
    DeadlineExpired { deadline: u64, now: u64 },
    #[error("unknown schema {0:?}")]
    UnknownSchema(H256),
    #[error("attestation rejected: {0}")]
    Rejected(String),
}

/// Call surface of the external attestation ledger.
pub trait Ledger {
    /// Verify and append one delegated attestation, returning its record UID.
    fn attest_by_delegation(
        &mut self,
        request: &SignedDelegatedAttestation,
    ) -> Result<H256, LedgerError>;
}

/// In-memory ledger performing the same checks the on-chain verifier does:
/// schema must be registered, deadline must not have passed, and the
/// signature must recover to the message's own `attester` field over the
/// canonical struct layout.
#[derive(Debug)]
pub struct InMemoryLedger {
    domain: Eip712Domain,
    schemas: BTreeSet<H256>,
    now: u64,
    accepted: Vec<(H256, SignedDelegatedAttestation)>,
}

impl InMemoryLedger {
    pub fn new(domain: Eip712Domain, schemas: impl IntoIterator<Item = H256>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self {
            domain,
            schemas: schemas.into_iter().collect(),
            now,
            accepted: Vec::new(),
        }
    }

    /// Pin the ledger clock (tests exercising deadline behavior).
    pub fn set_time(&mut self, now: u64) {
        self.now = now;
    }

    pub fn register_schema(&mut self, uid: H256) {
        self.schemas.insert(uid);
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn accepted(&self) -> &[(H256, SignedDelegatedAttestation)] {
        &self.accepted
    }
}

impl Ledger for InMemoryLedger {
    fn attest_by_delegation(
        &mut self,
        request: &SignedDelegatedAttestation,
    ) -> Result<H256, LedgerError> {
        let message = &request.message;
        if !self.schemas.contains(&message.schema) {
            return Err(LedgerError::UnknownSchema(message.schema));
        }
        // Deadline zero means "no deadline", matching the contract.
        if message.deadline != 0 && message.deadline < self.now {
            return Err(LedgerError::DeadlineExpired {
                deadline: message.deadline,
                now: self.now,
            });
        }

        let hash = message.signing_hash(&self.domain);
        let recovered = recover(hash, &request.signature)
            .map_err(|err| LedgerError::Rejected(err.to_string()))?;
        if recovered != message.attester {
            return Err(LedgerError::InvalidSignature {
                recovered,
                attester: message.attester,
            });
        }

        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(message.struct_hash().as_bytes());
        seed.extend_from_slice(&encode_u64(self.accepted.len() as u64));
        let uid = keccak256(&seed);
        self.accepted.push((uid, request.clone()));
        Ok(uid)
    }
}
