//! Bridges confirmed submissions to the attestation ledger.
//!
//! After the execution surface accepts a submission, the attestor builds
//! the ABI payload, signs the delegated attestation under the configured
//! domain, forwards it through the bit-packed counter, and writes the
//! durable [`AttestationRecord`]. Recovery re-enters here with the
//! recorded submission receipt: a fresh signature (and fresh deadline) is
//! generated on every attempt. The receipt, not the signature, is the
//! durable link to the submitted vote.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::Utc;
use primitive_types::{H160, H256, U256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use attest::abi::encode_vote_payload;
use attest::counter::{CounterError, LedgerCounter};
use attest::ledger::{Ledger, SignedDelegatedAttestation};
use attest::record::AttestationRecord;
use attest::signer::{AttestationSigner, SignerError};
use attest::typed_data::DelegatedAttestation;

use crate::core::types::Verdict;
use crate::io::surface::SubmissionReceipt;

/// Why an attestation attempt failed. `Ledger` variants carry the
/// verifying ledger's reason unmodified.
#[derive(Debug, Error)]
pub enum AttestError {
    #[error("signing failed: {0}")]
    Sign(#[from] SignerError),
    #[error(transparent)]
    Counter(#[from] CounterError),
}

/// A ledger-accepted attestation.
#[derive(Debug, Clone)]
pub struct AttestationOutcome {
    pub record_uid: H256,
    pub record: AttestationRecord,
}

/// Signs and forwards attestations for one signer key.
///
/// The signer is read-only and the counter is interior-locked, so one
/// attestor may serve concurrent runs for different source keys.
pub struct Attestor<L: Ledger> {
    signer: AttestationSigner,
    counter: Mutex<LedgerCounter<L>>,
    schema_uid: H256,
    deadline_secs: u64,
    records_dir: Option<PathBuf>,
    counter_path: Option<PathBuf>,
}

impl<L: Ledger> Attestor<L> {
    pub fn new(
        signer: AttestationSigner,
        counter: LedgerCounter<L>,
        schema_uid: H256,
        deadline_secs: u64,
    ) -> Self {
        Self {
            signer,
            counter: Mutex::new(counter),
            schema_uid,
            deadline_secs,
            records_dir: None,
            counter_path: None,
        }
    }

    /// Persist accepted records and the counter-word mirror under the
    /// given paths.
    pub fn with_store(mut self, records_dir: PathBuf, counter_path: PathBuf) -> Self {
        self.records_dir = Some(records_dir);
        self.counter_path = Some(counter_path);
        self
    }

    pub fn signer_address(&self) -> H160 {
        self.signer.address()
    }

    /// Count of ledger-accepted forwards for this signer.
    pub fn accepted_count(&self) -> U256 {
        let counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        counter.get_count(self.signer.address())
    }

    /// Sign and forward one attestation for a confirmed submission.
    #[instrument(skip_all, fields(source_key = %source_key, item_id = %item_id))]
    pub fn attest(
        &self,
        source_key: &str,
        item_id: &str,
        verdict: Verdict,
        choice: u8,
        decision_digest: H256,
        receipt: &SubmissionReceipt,
    ) -> Result<AttestationOutcome, AttestError> {
        let attester = self.signer.address();
        let payload =
            encode_vote_payload(item_id, source_key, U256::from(choice), receipt.digest);

        let message = DelegatedAttestation {
            attester,
            schema: self.schema_uid,
            recipient: attester,
            expiration_time: 0,
            revocable: true,
            ref_uid: H256::zero(),
            data: payload,
            value: U256::zero(),
            deadline: unix_now().saturating_add(self.deadline_secs),
        };
        let signature = self.signer.sign(&message)?;
        debug!(signature = %signature.to_hex(), "attestation signed");

        let request = SignedDelegatedAttestation { message, signature };
        let record_uid = {
            let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
            counter.forward_attestation(attester, &request)?
        };
        info!(record_uid = ?record_uid, "attestation accepted by ledger");

        let record = AttestationRecord {
            signer_address: attester,
            item_id: item_id.to_string(),
            source_key: source_key.to_string(),
            verdict: verdict.as_str().to_string(),
            choice,
            decision_digest,
            submission_reference: receipt.reference.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.persist(record_uid, &record) {
            // The ledger write already succeeded; a mirror failure must
            // not re-run it.
            warn!(error = %err, "failed to persist attestation artifacts");
        }

        Ok(AttestationOutcome { record_uid, record })
    }

    fn persist(&self, record_uid: H256, record: &AttestationRecord) -> Result<()> {
        if let Some(dir) = &self.records_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("create attestation dir {}", dir.display()))?;
            let path = dir.join(format!("{record_uid:x}.json"));
            let mut buf = serde_json::to_string_pretty(record).context("serialize record")?;
            buf.push('\n');
            fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(path) = &self.counter_path {
            let counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
            let mut buf =
                serde_json::to_string_pretty(&counter.snapshot()).context("serialize counter")?;
            buf.push('\n');
            fs::write(path, buf).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
