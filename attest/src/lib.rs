//! Typed-data attestation signing and the bit-packed ledger counter.
//!
//! This crate holds everything that must be byte-precise about
//! proof-of-decision attestations:
//!
//! - **[`typed_data`]**: EIP-712 domain separation and the delegated
//!   attestation message with its fixed, verifier-enforced field order.
//! - **[`signer`]**: deterministic recoverable ECDSA over the signing hash.
//! - **[`abi`]**: solidity ABI encoding of the vote payload.
//! - **[`ledger`]**: the append-only verifying ledger contract surface and an
//!   in-memory implementation that performs full verification.
//! - **[`counter`]**: the per-signer bit-packed attestation counter that
//!   fronts the ledger (bit 255 = active flag, bits 0–254 = count).
//! - **[`record`]**: the immutable record persisted per accepted attestation.
//!
//! Nothing here knows about proposals, decisions, or run orchestration; the
//! agent crate composes these pieces.

pub mod abi;
pub mod counter;
pub mod ledger;
pub mod record;
pub mod signer;
pub mod typed_data;
