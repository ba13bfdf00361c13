//! EIP-712 typed structured data for delegated attestations.
//!
//! The verifying contract recomputes the exact same domain separator and
//! struct hash from its own storage and rejects anything that differs, so
//! the field order and type descriptor strings in this module are part of
//! the wire protocol, not an implementation detail.

use primitive_types::{H160, H256, U256};
use sha3::{Digest, Keccak256};

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(bytes: &[u8]) -> H256 {
    H256(Keccak256::digest(bytes).into())
}

/// Type descriptor for the signing domain.
pub const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// Type descriptor for a delegated attestation.
///
/// `attester` is the first message field. The verifying ledger recomputes
/// this descriptor verbatim; reordering, renaming, or omitting a field
/// (omitting `attester` is the classic integration defect) produces a
/// different struct hash and the signature no longer recovers.
pub const ATTEST_TYPE: &str = "Attest(address attester,bytes32 schema,address recipient,\
uint64 expirationTime,bool revocable,bytes32 refUID,bytes data,uint256 value,uint64 deadline)";

/// Signing domain binding a signature to one deployment of the verifying
/// ledger on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip712Domain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: H160,
}

impl Eip712Domain {
    /// Domain separator: keccak over the domain typehash and the encoded
    /// domain fields.
    pub fn separator(&self) -> H256 {
        let mut enc = Vec::with_capacity(5 * 32);
        enc.extend_from_slice(keccak256(DOMAIN_TYPE.as_bytes()).as_bytes());
        enc.extend_from_slice(keccak256(self.name.as_bytes()).as_bytes());
        enc.extend_from_slice(keccak256(self.version.as_bytes()).as_bytes());
        enc.extend_from_slice(&encode_u64(self.chain_id));
        enc.extend_from_slice(&encode_address(self.verifying_contract));
        keccak256(&enc)
    }
}

/// Message body authorizing one ledger write.
///
/// Field order matches [`ATTEST_TYPE`] and must never change. The `data`
/// field carries the item-specific ABI payload, so no two items ever share
/// a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedAttestation {
    pub attester: H160,
    pub schema: H256,
    pub recipient: H160,
    pub expiration_time: u64,
    pub revocable: bool,
    pub ref_uid: H256,
    pub data: Vec<u8>,
    pub value: U256,
    pub deadline: u64,
}

impl DelegatedAttestation {
    /// Keccak of the canonical type descriptor.
    pub fn type_hash() -> H256 {
        keccak256(ATTEST_TYPE.as_bytes())
    }

    /// EIP-712 struct hash: typehash followed by each field encoded to a
    /// 32-byte word, dynamic `bytes` replaced by their keccak.
    pub fn struct_hash(&self) -> H256 {
        let mut enc = Vec::with_capacity(10 * 32);
        enc.extend_from_slice(Self::type_hash().as_bytes());
        enc.extend_from_slice(&encode_address(self.attester));
        enc.extend_from_slice(self.schema.as_bytes());
        enc.extend_from_slice(&encode_address(self.recipient));
        enc.extend_from_slice(&encode_u64(self.expiration_time));
        enc.extend_from_slice(&encode_bool(self.revocable));
        enc.extend_from_slice(self.ref_uid.as_bytes());
        enc.extend_from_slice(keccak256(&self.data).as_bytes());
        enc.extend_from_slice(&encode_u256(self.value));
        enc.extend_from_slice(&encode_u64(self.deadline));
        keccak256(&enc)
    }

    /// Final digest to sign: `keccak(0x19 0x01 ‖ separator ‖ struct_hash)`.
    pub fn signing_hash(&self, domain: &Eip712Domain) -> H256 {
        let mut enc = Vec::with_capacity(2 + 64);
        enc.extend_from_slice(&[0x19, 0x01]);
        enc.extend_from_slice(domain.separator().as_bytes());
        enc.extend_from_slice(self.struct_hash().as_bytes());
        keccak256(&enc)
    }
}

/// Left-pad an address to a 32-byte word.
pub(crate) fn encode_address(value: H160) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(value.as_bytes());
    word
}

/// Encode an unsigned integer as a big-endian 32-byte word.
pub(crate) fn encode_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encode a 256-bit integer as a big-endian 32-byte word.
pub(crate) fn encode_u256(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Encode a bool as a 32-byte word (0 or 1).
pub(crate) fn encode_bool(value: bool) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[31] = u8::from(value);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> Eip712Domain {
        Eip712Domain {
            name: "EAS".to_string(),
            version: "1.2.0".to_string(),
            chain_id: 8453,
            verifying_contract: H160::repeat_byte(0x21),
        }
    }

    fn message() -> DelegatedAttestation {
        DelegatedAttestation {
            attester: H160::repeat_byte(0xaa),
            schema: H256::repeat_byte(0x01),
            recipient: H160::repeat_byte(0xbb),
            expiration_time: 0,
            revocable: true,
            ref_uid: H256::zero(),
            data: vec![1, 2, 3],
            value: U256::zero(),
            deadline: 1_700_000_000,
        }
    }

    /// The type descriptor must keep `attester` as the first message field.
    #[test]
    fn attester_is_first_field_of_type_descriptor() {
        let fields = ATTEST_TYPE
            .trim_start_matches("Attest(")
            .trim_end_matches(')');
        let first = fields.split(',').next().expect("at least one field");
        assert_eq!(first, "address attester");
    }

    #[test]
    fn struct_hash_is_deterministic() {
        assert_eq!(message().struct_hash(), message().struct_hash());
    }

    #[test]
    fn struct_hash_covers_every_field() {
        let base = message().struct_hash();

        let mut m = message();
        m.attester = H160::repeat_byte(0xcc);
        assert_ne!(m.struct_hash(), base);

        let mut m = message();
        m.data = vec![9, 9, 9];
        assert_ne!(m.struct_hash(), base);

        let mut m = message();
        m.deadline += 1;
        assert_ne!(m.struct_hash(), base);

        let mut m = message();
        m.revocable = false;
        assert_ne!(m.struct_hash(), base);
    }

    #[test]
    fn signing_hash_binds_the_domain() {
        let msg = message();
        let other = Eip712Domain {
            chain_id: 1,
            ..domain()
        };
        assert_ne!(msg.signing_hash(&domain()), msg.signing_hash(&other));
    }

    #[test]
    fn word_encodings_are_left_padded() {
        let addr = encode_address(H160::repeat_byte(0xff));
        assert_eq!(&addr[..12], &[0u8; 12]);
        assert_eq!(&addr[12..], &[0xff; 20]);

        let one = encode_u64(1);
        assert_eq!(one[31], 1);
        assert_eq!(&one[..31], &[0u8; 31]);

        assert_eq!(encode_bool(true)[31], 1);
        assert_eq!(encode_bool(false), [0u8; 32]);
    }
}
