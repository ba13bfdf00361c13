//! Decision engine abstraction and the command-backed implementation.
//!
//! The [`DecisionEngine`] trait decouples the run coordinator from the
//! engine's internals (model, prompts, strategies). [`CommandEngine`]
//! spawns a configured command per item: the pending item arrives as JSON
//! on stdin, the decision must be written as JSON to the output path passed
//! as the final argument, and the result is validated against the vendored
//! schema before the coordinator ever sees it.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Decision, PendingItem};
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::retry::CallError;

const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

/// Contract for obtaining a verdict on one item.
///
/// Must not mutate external state. Errors are recoverable per item, never
/// fatal to the run.
pub trait DecisionEngine {
    fn decide(&self, item: &PendingItem) -> Result<Decision, CallError>;
}

impl<T: DecisionEngine + ?Sized> DecisionEngine for &T {
    fn decide(&self, item: &PendingItem) -> Result<Decision, CallError> {
        (**self).decide(item)
    }
}

/// Engine that delegates to an external command.
pub struct CommandEngine {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    /// Directory for per-item decision output files.
    output_dir: PathBuf,
}

impl CommandEngine {
    pub fn new(
        command: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
            output_dir: output_dir.into(),
        }
    }
}

impl DecisionEngine for CommandEngine {
    #[instrument(skip_all, fields(item_id = %item.item_id))]
    fn decide(&self, item: &PendingItem) -> Result<Decision, CallError> {
        let output_path = self.output_dir.join(format!(
            "{}.json",
            sanitize_for_filename(&item.item_id)
        ));
        fs::create_dir_all(&self.output_dir).map_err(|err| {
            CallError::Transient(format!(
                "create engine output dir {}: {err}",
                self.output_dir.display()
            ))
        })?;

        let stdin = serde_json::to_vec(item)
            .map_err(|err| CallError::Permanent(format!("encode item: {err}")))?;

        let mut cmd = command_from_argv(&self.command)
            .map_err(|err| CallError::Permanent(err.to_string()))?;
        cmd.arg(&output_path);

        info!(command = %self.command.join(" "), "invoking decision engine");
        let output =
            run_command_with_timeout(cmd, Some(&stdin), self.timeout, self.output_limit_bytes)
                .map_err(|err| CallError::Transient(format!("run decision engine: {err}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "decision engine timed out");
            return Err(CallError::Transient(format!(
                "decision engine timed out after {:?}",
                self.timeout
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "decision engine failed");
            return Err(CallError::Transient(format!(
                "decision engine exited with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            )));
        }

        let contents = fs::read_to_string(&output_path).map_err(|err| {
            CallError::Permanent(format!(
                "missing decision output {}: {err}",
                output_path.display()
            ))
        })?;
        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| CallError::Permanent(format!("parse decision output: {err}")))?;
        validate_decision_schema(&value)?;

        let decision: Decision = serde_json::from_value(value)
            .map_err(|err| CallError::Permanent(format!("deserialize decision: {err}")))?;
        if decision.item_id != item.item_id {
            return Err(CallError::Permanent(format!(
                "decision item id {:?} does not match requested item {:?}",
                decision.item_id, item.item_id
            )));
        }
        debug!(verdict = %decision.verdict, confidence = decision.confidence, "decision parsed");
        Ok(decision)
    }
}

/// Validate raw engine output against the vendored schema.
pub fn validate_decision_schema(value: &Value) -> Result<(), CallError> {
    let schema: Value = serde_json::from_str(DECISION_SCHEMA)
        .map_err(|err| CallError::Permanent(format!("parse vendored schema: {err}")))?;
    let compiled = validator_for(&schema)
        .map_err(|err| CallError::Permanent(format!("invalid vendored schema: {err}")))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(CallError::Permanent(format!(
            "decision schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

fn sanitize_for_filename(item_id: &str) -> String {
    item_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Verdict;

    fn item(id: &str) -> PendingItem {
        PendingItem {
            item_id: id.to_string(),
            origin: "0xaa".to_string(),
            payload: serde_json::json!({"title": "t"}),
        }
    }

    fn engine_writing(temp: &std::path::Path, body: &str) -> CommandEngine {
        // The scripted command ignores stdin and writes `body` to the
        // output path it receives as its final argument.
        CommandEngine::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat > /dev/null; printf '%s' '{body}' > \"$0\""),
            ],
            Duration::from_secs(5),
            10_000,
            temp.join("engine"),
        )
    }

    #[test]
    fn parses_valid_decision_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_writing(
            temp.path(),
            r#"{"item_id":"prop-1","verdict":"approve","confidence":0.9,"rationale":"ok","strategy_applied":"balanced"}"#,
        );
        let decision = engine.decide(&item("prop-1")).expect("decide");
        assert_eq!(decision.verdict, Verdict::Approve);
        assert!((decision.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_output_violating_the_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_writing(
            temp.path(),
            r#"{"item_id":"prop-1","verdict":"maybe","confidence":0.9,"rationale":"","strategy_applied":""}"#,
        );
        let err = engine.decide(&item("prop-1")).unwrap_err();
        assert!(matches!(err, CallError::Permanent(_)));
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_writing(
            temp.path(),
            r#"{"item_id":"prop-1","verdict":"approve","confidence":1.5,"rationale":"","strategy_applied":""}"#,
        );
        assert!(engine.decide(&item("prop-1")).is_err());
    }

    #[test]
    fn rejects_item_id_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_writing(
            temp.path(),
            r#"{"item_id":"other","verdict":"approve","confidence":0.5,"rationale":"","strategy_applied":""}"#,
        );
        let err = engine.decide(&item("prop-1")).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    fn engine_running(temp: &std::path::Path, script: &str) -> CommandEngine {
        CommandEngine::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
            10_000,
            temp.join("engine"),
        )
    }

    #[test]
    fn failing_command_is_transient() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_running(temp.path(), "cat > /dev/null; exit 1");
        let err = engine.decide(&item("prop-1")).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn missing_output_file_is_permanent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine_running(temp.path(), "cat > /dev/null; exit 0");
        let err = engine.decide(&item("prop-1")).unwrap_err();
        assert!(matches!(err, CallError::Permanent(_)));
    }
}
