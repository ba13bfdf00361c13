//! Execution surface: where decisions become submissions.
//!
//! The transport (chain RPC, multisig relay) is an external collaborator;
//! [`ExecutionSurface`] is the contract the run coordinator consumes.
//! The query side exists purely for crash recovery: given a source key and
//! item id, the surface must be able to say whether a submission already
//! happened.

use std::time::Duration;

use primitive_types::H256;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Decision;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::retry::CallError;

/// Proof of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    /// Opaque reference (e.g. a transaction hash) returned by the surface.
    pub reference: String,
    /// 32-byte digest of the submission, embedded in the attestation
    /// payload.
    pub digest: H256,
    /// Numeric choice the surface recorded, used when rebuilding state
    /// from a query.
    #[serde(default)]
    pub choice: Option<u8>,
}

/// Contract for submitting decisions and querying past submissions.
pub trait ExecutionSurface {
    fn submit(
        &self,
        source_key: &str,
        item_id: &str,
        decision: &Decision,
    ) -> Result<SubmissionReceipt, CallError>;

    /// Whether a submission already happened for `(source_key, item_id)`.
    fn find_submission(
        &self,
        source_key: &str,
        item_id: &str,
    ) -> Result<Option<SubmissionReceipt>, CallError>;
}

impl<T: ExecutionSurface + ?Sized> ExecutionSurface for &T {
    fn submit(
        &self,
        source_key: &str,
        item_id: &str,
        decision: &Decision,
    ) -> Result<SubmissionReceipt, CallError> {
        (**self).submit(source_key, item_id, decision)
    }

    fn find_submission(
        &self,
        source_key: &str,
        item_id: &str,
    ) -> Result<Option<SubmissionReceipt>, CallError> {
        (**self).find_submission(source_key, item_id)
    }
}

/// Surface that delegates to configured submit/query commands.
///
/// Both commands receive `source_key` and `item_id` as trailing arguments.
/// `submit` additionally receives the decision as JSON on stdin and must
/// print a [`SubmissionReceipt`] as JSON; `query` must print a receipt or
/// `null`.
pub struct CommandSurface {
    submit_command: Vec<String>,
    query_command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandSurface {
    pub fn new(
        submit_command: Vec<String>,
        query_command: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            submit_command,
            query_command,
            timeout,
            output_limit_bytes,
        }
    }

    fn run(
        &self,
        argv: &[String],
        source_key: &str,
        item_id: &str,
        stdin: Option<&[u8]>,
        label: &str,
    ) -> Result<String, CallError> {
        let mut cmd =
            command_from_argv(argv).map_err(|err| CallError::Permanent(err.to_string()))?;
        cmd.arg(source_key).arg(item_id);

        let output = run_command_with_timeout(cmd, stdin, self.timeout, self.output_limit_bytes)
            .map_err(|err| CallError::Transient(format!("run {label} command: {err}")))?;
        if output.timed_out {
            warn!(label, timeout_secs = self.timeout.as_secs(), "surface command timed out");
            return Err(CallError::Transient(format!(
                "{label} command timed out after {:?}",
                self.timeout
            )));
        }
        if !output.status.success() {
            warn!(label, exit_code = ?output.status.code(), "surface command failed");
            return Err(CallError::Transient(format!(
                "{label} command exited with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            )));
        }
        Ok(output.stdout_text())
    }
}

impl ExecutionSurface for CommandSurface {
    #[instrument(skip_all, fields(source_key = %source_key, item_id = %item_id))]
    fn submit(
        &self,
        source_key: &str,
        item_id: &str,
        decision: &Decision,
    ) -> Result<SubmissionReceipt, CallError> {
        let stdin = serde_json::to_vec(decision)
            .map_err(|err| CallError::Permanent(format!("encode decision: {err}")))?;
        info!("submitting decision to execution surface");
        let stdout = self.run(
            &self.submit_command,
            source_key,
            item_id,
            Some(&stdin),
            "submit",
        )?;
        let receipt: SubmissionReceipt = serde_json::from_str(stdout.trim()).map_err(|err| {
            CallError::Permanent(format!("parse submission receipt: {err}"))
        })?;
        debug!(reference = %receipt.reference, "submission accepted");
        Ok(receipt)
    }

    #[instrument(skip_all, fields(source_key = %source_key, item_id = %item_id))]
    fn find_submission(
        &self,
        source_key: &str,
        item_id: &str,
    ) -> Result<Option<SubmissionReceipt>, CallError> {
        let stdout = self.run(&self.query_command, source_key, item_id, None, "query")?;
        let receipt: Option<SubmissionReceipt> = serde_json::from_str(stdout.trim())
            .map_err(|err| CallError::Permanent(format!("parse query output: {err}")))?;
        Ok(receipt)
    }
}
