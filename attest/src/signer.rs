//! Deterministic ECDSA signing of delegated attestations.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use primitive_types::{H160, H256};
use thiserror::Error;

use crate::typed_data::{DelegatedAttestation, Eip712Domain, keccak256};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("secret is not a valid secp256k1 scalar")]
    InvalidKey,
    #[error("signing failed")]
    Signing,
    #[error("malformed signature")]
    MalformedSignature,
}

/// 65-byte recoverable signature (`r ‖ s ‖ v`, `v ∈ {27, 28}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub r: H256,
    pub s: H256,
    pub v: u8,
}

impl Signature {
    fn from_parts(signature: &EcdsaSignature, recovery: RecoveryId) -> Self {
        let bytes = signature.to_bytes();
        Self {
            r: H256::from_slice(&bytes[..32]),
            s: H256::from_slice(&bytes[32..]),
            v: 27 + recovery.to_byte(),
        }
    }

    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_bytes());
        out[32..64].copy_from_slice(self.s.as_bytes());
        out[64] = self.v;
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }
}

/// Holds the signing key and the domain it signs under.
///
/// Signing is deterministic (RFC 6979): identical key and message always
/// produce identical bytes. The key is read-only after construction and the
/// signer may be shared across concurrent runs.
pub struct AttestationSigner {
    key: SigningKey,
    domain: Eip712Domain,
}

impl AttestationSigner {
    pub fn new(secret: H256, domain: Eip712Domain) -> Result<Self, SignerError> {
        let key =
            SigningKey::from_slice(secret.as_bytes()).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self { key, domain })
    }

    /// Address derived from the public key (keccak of the uncompressed
    /// point, low 20 bytes).
    pub fn address(&self) -> H160 {
        address_of(self.key.verifying_key())
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    /// Sign the message's EIP-712 signing hash under this signer's domain.
    pub fn sign(&self, message: &DelegatedAttestation) -> Result<Signature, SignerError> {
        let hash = message.signing_hash(&self.domain);
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|_| SignerError::Signing)?;
        Ok(Signature::from_parts(&signature, recovery))
    }
}

impl std::fmt::Debug for AttestationSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationSigner")
            .field("address", &self.address())
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Recover the signing address from a hash and a 65-byte signature.
pub fn recover(hash: H256, signature: &Signature) -> Result<H160, SignerError> {
    let recovery = RecoveryId::from_byte(signature.v.wrapping_sub(27))
        .ok_or(SignerError::MalformedSignature)?;
    let ecdsa =
        EcdsaSignature::from_scalars(signature.r.to_fixed_bytes(), signature.s.to_fixed_bytes())
            .map_err(|_| SignerError::MalformedSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &ecdsa, recovery)
        .map_err(|_| SignerError::MalformedSignature)?;
    Ok(address_of(&key))
}

fn address_of(key: &VerifyingKey) -> H160 {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    H160::from_slice(&digest.as_bytes()[12..])
}

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use super::*;

    fn domain() -> Eip712Domain {
        Eip712Domain {
            name: "EAS".to_string(),
            version: "1.2.0".to_string(),
            chain_id: 8453,
            verifying_contract: H160::repeat_byte(0x21),
        }
    }

    fn secret(byte: u8) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[31] = byte;
        H256(bytes)
    }

    fn message(attester: H160) -> DelegatedAttestation {
        DelegatedAttestation {
            attester,
            schema: H256::repeat_byte(0x01),
            recipient: attester,
            expiration_time: 0,
            revocable: true,
            ref_uid: H256::zero(),
            data: vec![0xde, 0xad],
            value: U256::zero(),
            deadline: 1_700_000_000,
        }
    }

    /// Address of the secp256k1 key with scalar 1 is a published constant.
    #[test]
    fn derives_known_address_for_known_key() {
        let signer = AttestationSigner::new(secret(1), domain()).expect("signer");
        assert_eq!(
            format!("{:#x}", signer.address()),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    /// RFC 6979 signing: the same key and message always produce the same
    /// 65 bytes.
    #[test]
    fn signing_is_deterministic() {
        let signer = AttestationSigner::new(secret(7), domain()).expect("signer");
        let msg = message(signer.address());
        let first = signer.sign(&msg).expect("sign");
        let second = signer.sign(&msg).expect("sign");
        assert_eq!(first.to_bytes(), second.to_bytes());
        assert!(first.v == 27 || first.v == 28);
    }

    #[test]
    fn recover_round_trips_to_signer_address() {
        let signer = AttestationSigner::new(secret(7), domain()).expect("signer");
        let msg = message(signer.address());
        let signature = signer.sign(&msg).expect("sign");
        let recovered = recover(msg.signing_hash(&domain()), &signature).expect("recover");
        assert_eq!(recovered, signer.address());
    }

    /// A signature over one message does not recover to the signer for a
    /// different message hash.
    #[test]
    fn signature_does_not_transfer_across_messages() {
        let signer = AttestationSigner::new(secret(7), domain()).expect("signer");
        let msg = message(signer.address());
        let signature = signer.sign(&msg).expect("sign");

        let mut other = msg.clone();
        other.data = vec![0xbe, 0xef];
        let recovered = recover(other.signing_hash(&domain()), &signature);
        assert!(recovered.map(|addr| addr != signer.address()).unwrap_or(true));
    }

    #[test]
    fn rejects_invalid_recovery_byte() {
        let signer = AttestationSigner::new(secret(7), domain()).expect("signer");
        let msg = message(signer.address());
        let mut signature = signer.sign(&msg).expect("sign");
        signature.v = 99;
        assert_eq!(
            recover(msg.signing_hash(&domain()), &signature),
            Err(SignerError::MalformedSignature)
        );
    }

    #[test]
    fn rejects_zero_secret() {
        assert_eq!(
            AttestationSigner::new(H256::zero(), domain()).err(),
            Some(SignerError::InvalidKey)
        );
    }
}
