//! Unattended governance steward.
//!
//! The agent repeatedly discovers pending proposals, obtains a verdict
//! from a pluggable decision engine, submits the decision through an
//! execution surface, and records a signed proof-of-decision on an
//! append-only attestation ledger. It survives restarts, signals, and
//! partial failures without re-deciding or double-submitting. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, checkpoint
//!   transitions, candidate filtering). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (checkpoint persistence,
//!   subprocess collaborators, retry). Isolated to enable mocking in
//!   tests.
//!
//! Orchestration modules ([`run`], [`attestor`], [`shutdown`]) coordinate
//! core logic with I/O and the `attest` crate's signing and counter
//! machinery.

pub mod attestor;
pub mod config;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
