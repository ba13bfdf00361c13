//! End-to-end run scenarios over scripted collaborators and the in-memory
//! verifying ledger.

use primitive_types::U256;

use attest::ledger::InMemoryLedger;

use steward::core::filter::OriginPolicy;
use steward::io::checkpoint_store::CheckpointStore;
use steward::io::retry::{CallError, RetryPolicy};
use steward::run::{CoordinatorConfig, RunCoordinator, RunOptions};
use steward::test_support::{
    ScriptedEngine, ScriptedFeed, ScriptedSurface, decision, item, scratch_dir,
    test_attestor,
};

type TestCoordinator<'a> = RunCoordinator<
    &'a ScriptedFeed,
    &'a ScriptedEngine,
    &'a ScriptedSurface,
    InMemoryLedger,
>;

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        confidence_threshold: 0.7,
        max_items_per_run: 10,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
        },
        policy: OriginPolicy::default(),
    }
}

fn coordinator<'a>(
    dir: &std::path::Path,
    feed: &'a ScriptedFeed,
    engine: &'a ScriptedEngine,
    surface: &'a ScriptedSurface,
    config: CoordinatorConfig,
) -> TestCoordinator<'a> {
    let store = CheckpointStore::open(dir.join("checkpoints")).expect("store");
    RunCoordinator::new(feed, engine, surface, store, test_attestor(), config)
}

/// Three pending items with confidences [0.9, 0.5, 0.8] and verdicts
/// [approve, approve, reject] against a 0.7 threshold: items 1 and 3 are
/// submitted and attested (a reject is still actionable), item 2 is
/// skipped, and the ledger counter shows exactly two increments.
#[test]
fn mixed_confidence_scenario() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![
        item("prop-1", "0xaa"),
        item("prop-2", "0xbb"),
        item("prop-3", "0xcc"),
    ]);
    let engine = ScriptedEngine::new(vec![
        ("prop-1", Ok(decision("prop-1", Verdict::Approve, 0.9))),
        ("prop-2", Ok(decision("prop-2", Verdict::Approve, 0.5))),
        ("prop-3", Ok(decision("prop-3", Verdict::Reject, 0.8))),
    ]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let summary = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("run");

    assert_eq!(summary.decided, 3);
    assert_eq!(summary.submitted, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.simulated, 0);
    assert!(summary.errors.is_empty());

    assert_eq!(surface.submit_count("prop-1"), 1);
    assert_eq!(surface.submit_count("prop-2"), 0);
    assert_eq!(surface.submit_count("prop-3"), 1);
    assert_eq!(coordinator.attestor().accepted_count(), U256::from(2u8));
}

/// Re-running with an unchanged proposal set and a fully completed
/// checkpoint is a no-op: zero decided, zero submitted, zero errors.
#[test]
fn idempotent_skip_on_completed_checkpoint() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![item("prop-1", "0xaa"), item("prop-2", "0xbb")]);
    let engine = ScriptedEngine::new(vec![
        ("prop-1", Ok(decision("prop-1", Verdict::Approve, 0.9))),
        ("prop-2", Ok(decision("prop-2", Verdict::Reject, 0.9))),
    ]);
    let surface = ScriptedSurface::new();

    {
        let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
        let first = coordinator
            .run("spaceA", &RunOptions::default())
            .expect("first run");
        assert_eq!(first.submitted, 2);
    }

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let second = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("second run");

    assert_eq!(second.decided, 0);
    assert_eq!(second.submitted, 0);
    assert_eq!(second.skipped, 0);
    assert!(second.errors.is_empty());
    assert_eq!(surface.total_submissions(), 2);
    assert_eq!(engine.call_count("prop-1"), 1);
    assert_eq!(engine.call_count("prop-2"), 1);
}

/// No-action verdicts complete as skipped without touching the surface.
#[test]
fn no_action_verdict_is_skipped() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![item("prop-1", "0xaa")]);
    let engine = ScriptedEngine::new(vec![(
        "prop-1",
        Ok(decision("prop-1", Verdict::NoAction, 0.99)),
    )]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let summary = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("run");

    assert_eq!(summary.decided, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.submitted, 0);
    assert_eq!(surface.total_submissions(), 0);
}

/// Dry run decides and classifies but never submits or attests.
#[test]
fn dry_run_simulates_without_side_effects() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![item("prop-1", "0xaa")]);
    let engine = ScriptedEngine::new(vec![(
        "prop-1",
        Ok(decision("prop-1", Verdict::Approve, 0.95)),
    )]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let summary = coordinator
        .run("spaceA", &RunOptions { dry_run: true })
        .expect("run");

    assert_eq!(summary.decided, 1);
    assert_eq!(summary.simulated, 1);
    assert_eq!(summary.submitted, 0);
    assert_eq!(surface.total_submissions(), 0);
    assert_eq!(coordinator.attestor().accepted_count(), U256::zero());

    // The simulated item is terminal: the next run skips it entirely.
    let second = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("second run");
    assert_eq!(second.decided, 0);
    assert_eq!(engine.call_count("prop-1"), 1);
}

/// Engine failures are absorbed per item: the run continues, the item is
/// terminal-failed, and it is not retried by later runs.
#[test]
fn engine_failure_is_terminal_for_the_item_only() {
    use steward::core::types::{ItemPhase, Verdict};

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![item("prop-1", "0xaa"), item("prop-2", "0xbb")]);
    let engine = ScriptedEngine::new(vec![
        (
            "prop-1",
            Err(CallError::Permanent("model refused".to_string())),
        ),
        ("prop-2", Ok(decision("prop-2", Verdict::Approve, 0.9))),
    ]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let summary = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("run");

    assert_eq!(summary.decided, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].item_id, "prop-1");
    assert_eq!(summary.errors[0].phase, ItemPhase::Decide);

    // Failed items are completed, not retried on the next run.
    let second = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("second run");
    assert_eq!(second.decided, 0);
    assert_eq!(engine.call_count("prop-1"), 1);
}

/// Origin deny patterns filter items before the engine is invoked.
#[test]
fn denied_origins_never_reach_the_engine() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![item("prop-1", "0xbad"), item("prop-2", "0xok")]);
    let engine = ScriptedEngine::new(vec![
        ("prop-1", Ok(decision("prop-1", Verdict::Approve, 0.9))),
        ("prop-2", Ok(decision("prop-2", Verdict::Approve, 0.9))),
    ]);
    let surface = ScriptedSurface::new();

    let mut cfg = config();
    cfg.policy = OriginPolicy::from_patterns(&[], &["^0xbad$".to_string()]).expect("policy");
    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, cfg);
    let summary = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("run");

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(engine.call_count("prop-1"), 0);
    assert_eq!(engine.call_count("prop-2"), 1);
}

/// The per-run cap bounds how many items are decided in one invocation;
/// the remainder is picked up by the next run.
#[test]
fn per_run_cap_defers_items_to_the_next_run() {
    use steward::core::types::Verdict;

    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![
        item("prop-1", "0xaa"),
        item("prop-2", "0xbb"),
        item("prop-3", "0xcc"),
    ]);
    let engine = ScriptedEngine::new(vec![
        ("prop-1", Ok(decision("prop-1", Verdict::Approve, 0.9))),
        ("prop-2", Ok(decision("prop-2", Verdict::Approve, 0.9))),
        ("prop-3", Ok(decision("prop-3", Verdict::Approve, 0.9))),
    ]);
    let surface = ScriptedSurface::new();

    let mut cfg = config();
    cfg.max_items_per_run = 2;
    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, cfg);

    let first = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("first run");
    assert_eq!(first.decided, 2);

    let second = coordinator
        .run("spaceA", &RunOptions::default())
        .expect("second run");
    assert_eq!(second.decided, 1);
    assert_eq!(surface.total_submissions(), 3);
}

/// An unreachable feed is fatal to the run, not an item-level error.
#[test]
fn unreachable_feed_aborts_the_run() {
    let temp = scratch_dir();
    let feed = ScriptedFeed::failing(CallError::Transient("feed down".to_string()));
    let engine = ScriptedEngine::new(vec![]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());
    let err = coordinator
        .run("spaceA", &RunOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("proposal feed unavailable"));
}

/// A second run for the same source key is rejected while one is active;
/// sequential runs are fine.
#[test]
fn rejects_concurrent_runs_for_one_key() {
    let temp = scratch_dir();
    let feed = ScriptedFeed::new(vec![]);
    let engine = ScriptedEngine::new(vec![]);
    let surface = ScriptedSurface::new();

    let coordinator = coordinator(temp.path(), &feed, &engine, &surface, config());

    // Race two runs for the same key from separate threads.
    let barrier = std::sync::Barrier::new(2);
    let results: std::sync::Mutex<Vec<anyhow::Result<steward::core::types::RunSummary>>> =
        std::sync::Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                barrier.wait();
                let result = coordinator.run("spaceA", &RunOptions::default());
                results.lock().expect("results").push(result);
            });
        }
    });

    // Both threads finished; at most one may have been rejected, and any
    // rejection names the active key.
    let results = results.into_inner().expect("results");
    assert_eq!(results.len(), 2);
    for result in results {
        if let Err(err) = result {
            assert!(err.to_string().contains("already active"));
        }
    }

    // Sequential reruns always work.
    coordinator
        .run("spaceA", &RunOptions::default())
        .expect("sequential rerun");
}
