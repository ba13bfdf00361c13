//! Solidity ABI encoding of the attestation payload.
//!
//! The verifying ledger's schema declares the payload as
//! `(string item_id, string source_key, uint256 choice, bytes32 submission)`
//! and decodes it with the standard ABI layout: one head word per field
//! (dynamic fields hold an offset), tails appended in field order.

use primitive_types::{H256, U256};

use crate::typed_data::encode_u256;

/// Encode `(string, string, uint256, bytes32)` as solidity `abi.encode`.
pub fn encode_vote_payload(
    item_id: &str,
    source_key: &str,
    choice: U256,
    submission: H256,
) -> Vec<u8> {
    let head_len = 4 * 32;
    let item_tail = encode_bytes_tail(item_id.as_bytes());
    let source_tail = encode_bytes_tail(source_key.as_bytes());

    let mut out = Vec::with_capacity(head_len + item_tail.len() + source_tail.len());
    out.extend_from_slice(&encode_u256(U256::from(head_len)));
    out.extend_from_slice(&encode_u256(U256::from(head_len + item_tail.len())));
    out.extend_from_slice(&encode_u256(choice));
    out.extend_from_slice(submission.as_bytes());
    out.extend_from_slice(&item_tail);
    out.extend_from_slice(&source_tail);
    out
}

/// Dynamic tail: length word followed by the bytes padded to a word
/// boundary. Empty input encodes as a single zero length word.
fn encode_bytes_tail(bytes: &[u8]) -> Vec<u8> {
    let padded = bytes.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(32 + padded);
    out.extend_from_slice(&encode_u256(U256::from(bytes.len())));
    out.extend_from_slice(bytes);
    out.resize(32 + padded, 0);
    out
}
