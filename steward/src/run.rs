//! Orchestration of one agent run: recover, list, filter, decide, submit,
//! attest, checkpoint.
//!
//! Durability discipline per item: the checkpoint is written *before* the
//! decision engine is called (the item is in flight), after every terminal
//! classification, and again only once the ledger has acknowledged the
//! attestation. A submission is checkpointed with its receipt before
//! signing starts, so a crash anywhere in the pipeline can be reconciled
//! on the next start without re-deciding or double-submitting.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use attest::ledger::Ledger;

use crate::attestor::Attestor;
use crate::core::checkpoint::{PendingAttestation, RunCheckpoint};
use crate::core::filter::{OriginPolicy, select_candidates};
use crate::core::types::{ItemPhase, PendingItem, RunSummary, Verdict};
use crate::io::checkpoint_store::CheckpointStore;
use crate::io::engine::DecisionEngine;
use crate::io::feed::ProposalSource;
use crate::io::retry::{RetryPolicy, with_retry};
use crate::io::surface::{ExecutionSurface, SubmissionReceipt};
use crate::shutdown::{InFlightGauge, Participant};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Decide and classify without submitting or attesting.
    pub dry_run: bool,
}

/// Tunables for the coordinator, usually taken from [`crate::config`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub confidence_threshold: f64,
    pub max_items_per_run: usize,
    pub retry: RetryPolicy,
    pub policy: OriginPolicy,
}

/// Orchestrates runs over explicit collaborators; no process-wide state.
pub struct RunCoordinator<S, D, X, L>
where
    S: ProposalSource,
    D: DecisionEngine,
    X: ExecutionSurface,
    L: Ledger,
{
    feed: S,
    engine: D,
    surface: X,
    store: CheckpointStore,
    attestor: Attestor<L>,
    config: CoordinatorConfig,
    quiesce: Arc<AtomicBool>,
    gauge: InFlightGauge,
    active_keys: Mutex<BTreeSet<String>>,
}

impl<S, D, X, L> RunCoordinator<S, D, X, L>
where
    S: ProposalSource,
    D: DecisionEngine,
    X: ExecutionSurface,
    L: Ledger,
{
    pub fn new(
        feed: S,
        engine: D,
        surface: X,
        store: CheckpointStore,
        attestor: Attestor<L>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            feed,
            engine,
            surface,
            store,
            attestor,
            config,
            quiesce: Arc::new(AtomicBool::new(false)),
            gauge: InFlightGauge::new(),
            active_keys: Mutex::new(BTreeSet::new()),
        }
    }

    /// Share an externally owned quiesce flag (e.g. the signal flag).
    pub fn with_quiesce_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.quiesce = flag;
        self
    }

    pub fn quiesce_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quiesce)
    }

    pub fn gauge(&self) -> InFlightGauge {
        self.gauge.clone()
    }

    pub fn attestor(&self) -> &Attestor<L> {
        &self.attestor
    }

    /// Shutdown participant handle for this coordinator.
    pub fn participant(&self) -> CoordinatorParticipant {
        CoordinatorParticipant {
            flag: Arc::clone(&self.quiesce),
        }
    }

    /// Execute one run for `source_key`.
    ///
    /// Individual item failures are absorbed into the summary; only an
    /// unreachable proposal feed or checkpoint store is fatal. A second
    /// concurrent run for the same key is rejected outright.
    #[instrument(skip_all, fields(source_key = %source_key, dry_run = options.dry_run))]
    pub fn run(&self, source_key: &str, options: &RunOptions) -> Result<RunSummary> {
        let _claim = self.claim_key(source_key)?;
        let mut checkpoint = self
            .store
            .load(source_key)
            .context("checkpoint store unavailable")?;
        let mut summary = RunSummary::new(source_key);

        if checkpoint.unclean_shutdown() && checkpoint.in_flight.is_empty() {
            info!("previous run ended uncleanly but left nothing in flight");
        }
        self.recover(&mut checkpoint, &mut summary, source_key)?;

        checkpoint.mark_started(Utc::now());
        self.store.save(&checkpoint)?;

        let items = with_retry(&self.config.retry, "list pending proposals", || {
            self.feed.list_pending(source_key)
        })
        .map_err(|err| anyhow!("proposal feed unavailable: {err}"))?;

        // Items still in flight after recovery have an unknown outcome and
        // may only be touched by the recovery path, never re-decided.
        let excluded: BTreeSet<String> = checkpoint
            .completed
            .union(&checkpoint.in_flight)
            .cloned()
            .collect();
        let selection = select_candidates(
            items,
            &excluded,
            &self.config.policy,
            self.config.max_items_per_run,
        );
        for item_id in &selection.denied {
            debug!(item_id = %item_id, "skipped by origin policy");
        }
        summary.skipped += selection.denied.len() as u32;
        if selection.truncated > 0 {
            info!(
                truncated = selection.truncated,
                cap = self.config.max_items_per_run,
                "per-run cap reached; remaining items deferred to the next run"
            );
        }

        for item in &selection.candidates {
            if self.quiesce.load(Ordering::SeqCst) {
                info!("quiesce requested; not starting further items");
                break;
            }
            let _work = self.gauge.enter();
            self.process_item(&mut checkpoint, &mut summary, source_key, item, options)?;
        }

        checkpoint.mark_finished(Utc::now());
        self.store.save(&checkpoint)?;

        info!(
            decided = summary.decided,
            submitted = summary.submitted,
            skipped = summary.skipped,
            simulated = summary.simulated,
            errors = summary.errors.len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Reconcile items left in flight by an unclean shutdown. Runs to
    /// completion before any new item is considered; this is the sole
    /// mechanism preventing double submission after a crash.
    fn recover(
        &self,
        checkpoint: &mut RunCheckpoint,
        summary: &mut RunSummary,
        source_key: &str,
    ) -> Result<()> {
        if checkpoint.in_flight.is_empty() {
            return Ok(());
        }
        info!(
            in_flight = checkpoint.in_flight.len(),
            "recovering items left in flight by an unclean shutdown"
        );

        for item_id in checkpoint.in_flight.clone() {
            if let Some(pending) = checkpoint.pending_attestations.get(&item_id).cloned() {
                // The submission is confirmed; only the attestation is
                // outstanding. Retry it with a fresh signature.
                self.attest_pending(checkpoint, summary, source_key, &item_id, &pending)?;
                continue;
            }

            let found = with_retry(&self.config.retry, "query execution surface", || {
                self.surface.find_submission(source_key, &item_id)
            });
            match found {
                Ok(Some(receipt)) => {
                    // The vote landed just before the crash. Rebuild the
                    // pending attestation from the checkpointed decision
                    // and attest retroactively; never resubmit.
                    match self.rebuild_pending(checkpoint, &item_id, &receipt) {
                        Some(pending) => {
                            checkpoint
                                .record_submission(&item_id, pending.clone())
                                .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
                            self.store.save(checkpoint)?;
                            self.attest_pending(
                                checkpoint, summary, source_key, &item_id, &pending,
                            )?;
                        }
                        None => {
                            warn!(
                                item_id = %item_id,
                                "submission found but no decision recorded; completing without attestation"
                            );
                            summary.record_failure(
                                &item_id,
                                ItemPhase::Attest,
                                "recovered submission has no recorded decision",
                            );
                            checkpoint
                                .complete_item(&item_id)
                                .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
                            self.store.save(checkpoint)?;
                        }
                    }
                }
                Ok(None) => {
                    // No side effect ever happened; the item returns to
                    // the candidate pool and is re-decided from scratch.
                    debug!(item_id = %item_id, "no submission found; item returns to the pool");
                    checkpoint
                        .abandon_in_flight(&item_id)
                        .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
                    self.store.save(checkpoint)?;
                }
                Err(err) => {
                    // Unknown outcome: leave the item in flight so it is
                    // neither re-decided nor dropped.
                    warn!(item_id = %item_id, error = %err, "cannot establish submission status");
                    summary.record_failure(
                        &item_id,
                        ItemPhase::Submit,
                        format!("recovery query failed: {err} (pending recovery)"),
                    );
                }
            }
        }

        debug_assert!(checkpoint.is_consistent());
        Ok(())
    }

    /// Retry the attestation for a checkpointed submission.
    fn attest_pending(
        &self,
        checkpoint: &mut RunCheckpoint,
        summary: &mut RunSummary,
        source_key: &str,
        item_id: &str,
        pending: &PendingAttestation,
    ) -> Result<()> {
        let receipt = SubmissionReceipt {
            reference: pending.submission_reference.clone(),
            digest: pending.submission_digest,
            choice: Some(pending.choice),
        };
        match self.attestor.attest(
            source_key,
            item_id,
            pending.verdict,
            pending.choice,
            pending.decision_digest,
            &receipt,
        ) {
            Ok(outcome) => {
                info!(item_id, record_uid = ?outcome.record_uid, "recovered attestation accepted");
                checkpoint
                    .complete_item(item_id)
                    .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
                self.store.save(checkpoint)?;
            }
            Err(err) => {
                warn!(item_id, error = %err, "attestation retry failed; item stays in flight");
                summary.record_failure(
                    item_id,
                    ItemPhase::Attest,
                    format!("{err} (pending recovery)"),
                );
            }
        }
        Ok(())
    }

    /// Reconstruct a pending attestation for a submission discovered via
    /// the surface query.
    fn rebuild_pending(
        &self,
        checkpoint: &RunCheckpoint,
        item_id: &str,
        receipt: &SubmissionReceipt,
    ) -> Option<PendingAttestation> {
        let decision = checkpoint.decisions.get(item_id)?;
        let choice = receipt
            .choice
            .or_else(|| decision.verdict.choice())?;
        let decision_digest = decision.digest().ok()?;
        Some(PendingAttestation {
            submission_reference: receipt.reference.clone(),
            submission_digest: receipt.digest,
            verdict: Verdict::from_choice(choice).unwrap_or(decision.verdict),
            choice,
            decision_digest,
        })
    }

    /// Drive one candidate through decide → submit → attest, checkpointing
    /// at every durability point. Returns `Err` only for checkpoint-store
    /// failures; item failures are absorbed into the summary.
    fn process_item(
        &self,
        checkpoint: &mut RunCheckpoint,
        summary: &mut RunSummary,
        source_key: &str,
        item: &PendingItem,
        options: &RunOptions,
    ) -> Result<()> {
        let item_id = item.item_id.as_str();
        checkpoint
            .begin_item(item_id)
            .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
        // Durability point A: in flight before any side effect.
        self.store.save(checkpoint)?;

        let decision = match with_retry(&self.config.retry, "decision engine", || {
            self.engine.decide(item)
        }) {
            Ok(decision) => decision,
            Err(err) => {
                // Engine failures are terminal for the item within this
                // run; the next run may supersede the outcome.
                warn!(item_id, error = %err, "decision engine failed");
                summary.record_failure(item_id, ItemPhase::Decide, err.to_string());
                return self.complete(checkpoint, item_id);
            }
        };
        summary.decided += 1;

        let decision_digest = match decision.digest() {
            Ok(digest) => digest,
            Err(err) => {
                summary.record_failure(
                    item_id,
                    ItemPhase::Decide,
                    format!("encode decision: {err}"),
                );
                return self.complete(checkpoint, item_id);
            }
        };

        let below_threshold = decision.confidence < self.config.confidence_threshold;
        let choice = match decision.verdict.choice() {
            Some(choice) if !below_threshold => choice,
            _ => {
                info!(
                    item_id,
                    verdict = %decision.verdict,
                    confidence = decision.confidence,
                    threshold = self.config.confidence_threshold,
                    "skipped by policy"
                );
                summary.skipped += 1;
                return self.complete(checkpoint, item_id);
            }
        };

        if options.dry_run {
            info!(item_id, verdict = %decision.verdict, "dry run: submission simulated");
            summary.simulated += 1;
            return self.complete(checkpoint, item_id);
        }

        // The decision becomes durable before the submission side effect,
        // so recovery can always rebuild the attestation content.
        checkpoint
            .record_decision(&decision)
            .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
        self.store.save(checkpoint)?;

        let receipt = match with_retry(&self.config.retry, "execution surface", || {
            self.surface.submit(source_key, item_id, &decision)
        }) {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(item_id, error = %err, "submission failed");
                summary.record_failure(item_id, ItemPhase::Submit, err.to_string());
                return self.complete(checkpoint, item_id);
            }
        };
        summary.submitted += 1;

        checkpoint
            .record_submission(
                item_id,
                PendingAttestation {
                    submission_reference: receipt.reference.clone(),
                    submission_digest: receipt.digest,
                    verdict: decision.verdict,
                    choice,
                    decision_digest,
                },
            )
            .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
        // The confirmed submission is durable before signing begins.
        self.store.save(checkpoint)?;

        match self.attestor.attest(
            source_key,
            item_id,
            decision.verdict,
            choice,
            decision_digest,
            &receipt,
        ) {
            Ok(outcome) => {
                info!(item_id, record_uid = ?outcome.record_uid, "attested");
                // Durability point C: completion only after the ledger
                // acknowledged the write.
                self.complete(checkpoint, item_id)
            }
            Err(err) => {
                // The vote is cast; only the proof is missing. The item
                // stays in flight and the next run retries the
                // attestation with the recorded receipt.
                warn!(item_id, error = %err, "attestation failed; queued for recovery");
                summary.record_failure(
                    item_id,
                    ItemPhase::Attest,
                    format!("{err} (pending recovery)"),
                );
                Ok(())
            }
        }
    }

    /// Move an item to `completed` and write durability point B/C.
    fn complete(&self, checkpoint: &mut RunCheckpoint, item_id: &str) -> Result<()> {
        checkpoint
            .complete_item(item_id)
            .map_err(|err| anyhow!("checkpoint violation: {err}"))?;
        self.store.save(checkpoint)
    }

    fn claim_key(&self, source_key: &str) -> Result<KeyClaim<'_>> {
        let mut keys = self
            .active_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(source_key.to_string()) {
            return Err(anyhow!("a run is already active for source key {source_key}"));
        }
        Ok(KeyClaim {
            keys: &self.active_keys,
            source_key: source_key.to_string(),
        })
    }
}

/// Releases the per-key run claim on drop, even on error paths.
struct KeyClaim<'coordinator> {
    keys: &'coordinator Mutex<BTreeSet<String>>,
    source_key: String,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.remove(&self.source_key);
    }
}

/// Shutdown-protocol handle for the run coordinator.
///
/// Quiescing raises the shared flag so no new item starts; checkpoints are
/// written at every durability point already, so persist has nothing extra
/// to flush.
pub struct CoordinatorParticipant {
    flag: Arc<AtomicBool>,
}

impl Participant for CoordinatorParticipant {
    fn name(&self) -> &str {
        "run-coordinator"
    }

    fn quiesce(&self) -> Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}
