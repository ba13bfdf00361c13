//! Test-only scripted collaborators and fixtures.
//!
//! Scripted doubles record every call so tests can assert exact call
//! counts; the no-double-submission property is stated in terms of how
//! often the execution surface was invoked.

use std::collections::HashMap;
use std::sync::Mutex;

use primitive_types::{H160, H256};

use attest::counter::LedgerCounter;
use attest::ledger::InMemoryLedger;
use attest::signer::AttestationSigner;
use attest::typed_data::Eip712Domain;

use crate::attestor::Attestor;
use crate::core::types::{Decision, PendingItem, Verdict};
use crate::io::engine::DecisionEngine;
use crate::io::feed::ProposalSource;
use crate::io::retry::CallError;
use crate::io::surface::{ExecutionSurface, SubmissionReceipt};

/// Fresh scratch directory acting as a store root for one test.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Deterministic pending item.
pub fn item(id: &str, origin: &str) -> PendingItem {
    PendingItem {
        item_id: id.to_string(),
        origin: origin.to_string(),
        payload: serde_json::json!({ "title": format!("{id} title") }),
    }
}

/// Deterministic decision with explicit verdict and confidence.
pub fn decision(id: &str, verdict: Verdict, confidence: f64) -> Decision {
    Decision {
        item_id: id.to_string(),
        verdict,
        confidence,
        rationale: format!("{id} rationale"),
        strategy_applied: "balanced".to_string(),
    }
}

/// Signing domain used across tests.
pub fn test_domain() -> Eip712Domain {
    Eip712Domain {
        name: "EAS".to_string(),
        version: "1.2.0".to_string(),
        chain_id: 8453,
        verifying_contract: H160::repeat_byte(0x21),
    }
}

pub fn test_schema_uid() -> H256 {
    H256::repeat_byte(0x01)
}

/// Attestor over an in-memory verifying ledger, no persistence.
pub fn test_attestor() -> Attestor<InMemoryLedger> {
    let mut secret = [0u8; 32];
    secret[31] = 7;
    let signer = AttestationSigner::new(H256(secret), test_domain()).expect("signer");
    let ledger = InMemoryLedger::new(test_domain(), [test_schema_uid()]);
    let counter =
        LedgerCounter::new(ledger, H160::repeat_byte(0x21), signer.address()).expect("counter");
    Attestor::new(signer, counter, test_schema_uid(), 3600)
}

/// Feed returning a fixed item list.
pub struct ScriptedFeed {
    pub items: Vec<PendingItem>,
    pub fail: Option<CallError>,
    pub calls: Mutex<u32>,
}

impl ScriptedFeed {
    pub fn new(items: Vec<PendingItem>) -> Self {
        Self {
            items,
            fail: None,
            calls: Mutex::new(0),
        }
    }

    pub fn failing(error: CallError) -> Self {
        Self {
            items: Vec::new(),
            fail: Some(error),
            calls: Mutex::new(0),
        }
    }
}

impl ProposalSource for ScriptedFeed {
    fn list_pending(&self, _source_key: &str) -> Result<Vec<PendingItem>, CallError> {
        *self.calls.lock().expect("calls lock") += 1;
        match &self.fail {
            Some(error) => Err(error.clone()),
            None => Ok(self.items.clone()),
        }
    }
}

/// Engine serving scripted decisions per item id, recording call order.
pub struct ScriptedEngine {
    outputs: HashMap<String, Result<Decision, CallError>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new(outputs: Vec<(&str, Result<Decision, CallError>)>) -> Self {
        Self {
            outputs: outputs
                .into_iter()
                .map(|(id, output)| (id.to_string(), output))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self, item_id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|call| call.as_str() == item_id)
            .count()
    }
}

impl DecisionEngine for ScriptedEngine {
    fn decide(&self, item: &PendingItem) -> Result<Decision, CallError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(item.item_id.clone());
        match self.outputs.get(&item.item_id) {
            Some(output) => output.clone(),
            None => Err(CallError::Permanent(format!(
                "no scripted decision for {}",
                item.item_id
            ))),
        }
    }
}

/// Surface recording submissions; optionally failing them, and answering
/// recovery queries from a scripted map plus its own submission log.
pub struct ScriptedSurface {
    pub submissions: Mutex<Vec<(String, String)>>,
    pub known: Mutex<HashMap<String, SubmissionReceipt>>,
    pub fail_submit: Option<CallError>,
    pub fail_query: Option<CallError>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            known: Mutex::new(HashMap::new()),
            fail_submit: None,
            fail_query: None,
        }
    }

    /// Pre-record a submission as already present on the surface.
    pub fn record_known(&self, item_id: &str, receipt: SubmissionReceipt) {
        self.known
            .lock()
            .expect("known lock")
            .insert(item_id.to_string(), receipt);
    }

    pub fn submit_count(&self, item_id: &str) -> usize {
        self.submissions
            .lock()
            .expect("submissions lock")
            .iter()
            .filter(|(submitted, _)| submitted == item_id)
            .count()
    }

    pub fn total_submissions(&self) -> usize {
        self.submissions.lock().expect("submissions lock").len()
    }
}

impl Default for ScriptedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionSurface for ScriptedSurface {
    fn submit(
        &self,
        _source_key: &str,
        item_id: &str,
        decision: &Decision,
    ) -> Result<SubmissionReceipt, CallError> {
        if let Some(error) = &self.fail_submit {
            return Err(error.clone());
        }
        let reference = format!("0xtx-{item_id}");
        let digest = H256(sha2_digest(reference.as_bytes()));
        let receipt = SubmissionReceipt {
            reference,
            digest,
            choice: decision.verdict.choice(),
        };
        self.submissions
            .lock()
            .expect("submissions lock")
            .push((item_id.to_string(), decision.verdict.as_str().to_string()));
        self.known
            .lock()
            .expect("known lock")
            .insert(item_id.to_string(), receipt.clone());
        Ok(receipt)
    }

    fn find_submission(
        &self,
        _source_key: &str,
        item_id: &str,
    ) -> Result<Option<SubmissionReceipt>, CallError> {
        if let Some(error) = &self.fail_query {
            return Err(error.clone());
        }
        Ok(self.known.lock().expect("known lock").get(item_id).cloned())
    }
}

fn sha2_digest(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(bytes).into()
}
