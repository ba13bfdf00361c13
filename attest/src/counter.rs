//! Per-signer attestation counter packed into a single 256-bit word.
//!
//! Bit 255 is the signer's active flag, settable only by the controller.
//! Bits 0–254 count accepted forwards. The two halves are independent:
//! toggling the flag never touches the count and incrementing never touches
//! the flag. Every entry point goes through [`pack`] and [`unpack`] so the
//! mask arithmetic lives in exactly one place.

use std::collections::BTreeMap;

use primitive_types::{H160, H256, U256};
use thiserror::Error;

use crate::ledger::{Ledger, LedgerError, SignedDelegatedAttestation};

/// Bit mask selecting the active flag (bit 255).
fn flag_mask() -> U256 {
    U256::one() << 255
}

/// Bit mask selecting the count (bits 0–254).
fn count_mask() -> U256 {
    U256::MAX >> 1
}

/// Combine an active flag and a count into one storage word. Counts wider
/// than 255 bits are masked; callers guard overflow before packing.
pub fn pack(active: bool, count: U256) -> U256 {
    let masked = count & count_mask();
    if active { masked | flag_mask() } else { masked }
}

/// Split a storage word into `(active, count)`.
pub fn unpack(word: U256) -> (bool, U256) {
    (word.bit(255), word & count_mask())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("verifying ledger address must not be zero")]
    ZeroLedgerAddress,
    #[error("caller {0:?} is not the controller")]
    NotController(H160),
    #[error("attestation count overflow for {0:?}")]
    CounterOverflow(H160),
    /// The underlying ledger rejected the forward; the reason passes
    /// through unmodified.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Counter contract fronting the verifying ledger.
///
/// `forward_attestation` increments the caller's count before forwarding;
/// a ledger rejection rolls the word back in the same call, so an
/// incremented count with a failed forward is never observable.
#[derive(Debug)]
pub struct LedgerCounter<L: Ledger> {
    ledger: L,
    controller: H160,
    words: BTreeMap<H160, U256>,
}

impl<L: Ledger> LedgerCounter<L> {
    /// Construct over a deployed ledger. Rejects the zero address, which
    /// would silently blackhole every forward.
    pub fn new(ledger: L, ledger_address: H160, controller: H160) -> Result<Self, CounterError> {
        if ledger_address.is_zero() {
            return Err(CounterError::ZeroLedgerAddress);
        }
        Ok(Self {
            ledger,
            controller,
            words: BTreeMap::new(),
        })
    }

    /// Set or clear a signer's active flag. Controller-only; the count in
    /// bits 0–254 is preserved bit for bit.
    pub fn set_active(
        &mut self,
        caller: H160,
        signer: H160,
        active: bool,
    ) -> Result<(), CounterError> {
        if caller != self.controller {
            return Err(CounterError::NotController(caller));
        }
        let word = self.words.entry(signer).or_insert_with(U256::zero);
        let (_, count) = unpack(*word);
        *word = pack(active, count);
        Ok(())
    }

    /// Increment the caller's count, then forward the request to the
    /// ledger. On rejection the increment is rolled back and the ledger's
    /// reason is returned unmodified.
    pub fn forward_attestation(
        &mut self,
        caller: H160,
        request: &SignedDelegatedAttestation,
    ) -> Result<H256, CounterError> {
        let previous = self.words.get(&caller).copied().unwrap_or_default();
        let (active, count) = unpack(previous);
        if count == count_mask() {
            return Err(CounterError::CounterOverflow(caller));
        }
        self.words.insert(caller, pack(active, count + U256::one()));

        match self.ledger.attest_by_delegation(request) {
            Ok(uid) => Ok(uid),
            Err(err) => {
                self.words.insert(caller, previous);
                Err(CounterError::Ledger(err))
            }
        }
    }

    pub fn get_count(&self, signer: H160) -> U256 {
        unpack(self.word(signer)).1
    }

    pub fn is_active(&self, signer: H160) -> bool {
        unpack(self.word(signer)).0
    }

    pub fn get_info(&self, signer: H160) -> (U256, bool) {
        let (active, count) = unpack(self.word(signer));
        (count, active)
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    /// Raw storage words, keyed by signer (persistence mirror).
    pub fn snapshot(&self) -> BTreeMap<H160, U256> {
        self.words.clone()
    }

    /// Replace the storage words (restoring a persisted mirror).
    pub fn restore(&mut self, words: BTreeMap<H160, U256>) {
        self.words = words;
    }

    fn word(&self, signer: H160) -> U256 {
        self.words.get(&signer).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use super::*;

    /// Ledger double that rejects everything with a fixed reason.
    struct RejectingLedger(LedgerError);

    impl Ledger for RejectingLedger {
        fn attest_by_delegation(
            &mut self,
            _request: &SignedDelegatedAttestation,
        ) -> Result<H256, LedgerError> {
            Err(self.0.clone())
        }
    }

    /// Ledger double that accepts everything.
    struct AcceptingLedger(u64);

    impl Ledger for AcceptingLedger {
        fn attest_by_delegation(
            &mut self,
            _request: &SignedDelegatedAttestation,
        ) -> Result<H256, LedgerError> {
            self.0 += 1;
            Ok(H256::from_low_u64_be(self.0))
        }
    }

    fn request() -> SignedDelegatedAttestation {
        use crate::signer::Signature;
        use crate::typed_data::DelegatedAttestation;
        SignedDelegatedAttestation {
            message: DelegatedAttestation {
                attester: H160::repeat_byte(0xaa),
                schema: H256::repeat_byte(0x01),
                recipient: H160::repeat_byte(0xaa),
                expiration_time: 0,
                revocable: true,
                ref_uid: H256::zero(),
                data: vec![1],
                value: U256::zero(),
                deadline: 0,
            },
            signature: Signature {
                r: H256::repeat_byte(0x11),
                s: H256::repeat_byte(0x22),
                v: 27,
            },
        }
    }

    fn counter(ledger: AcceptingLedger) -> LedgerCounter<AcceptingLedger> {
        LedgerCounter::new(ledger, H160::repeat_byte(0x21), H160::repeat_byte(0xc0))
            .expect("counter")
    }

    #[test]
    fn pack_unpack_round_trips_at_boundaries() {
        for count in [U256::zero(), U256::one(), U256::MAX >> 1] {
            for active in [false, true] {
                assert_eq!(unpack(pack(active, count)), (active, count));
            }
        }
    }

    #[test]
    fn pack_masks_counts_wider_than_255_bits() {
        let (active, count) = unpack(pack(false, U256::MAX));
        assert!(!active);
        assert_eq!(count, U256::MAX >> 1);
    }

    #[test]
    fn rejects_zero_ledger_address() {
        let err = LedgerCounter::new(AcceptingLedger(0), H160::zero(), H160::repeat_byte(0xc0))
            .err()
            .expect("reject");
        assert_eq!(err, CounterError::ZeroLedgerAddress);
    }

    #[test]
    fn set_active_is_controller_only() {
        let mut counter = counter(AcceptingLedger(0));
        let outsider = H160::repeat_byte(0x99);
        let err = counter
            .set_active(outsider, H160::repeat_byte(0xaa), true)
            .unwrap_err();
        assert_eq!(err, CounterError::NotController(outsider));
    }

    /// Interleaved toggles and increments never disturb each other: after
    /// N accepted forwards the count is exactly N, and the flag equals the
    /// last toggle regardless of ordering.
    #[test]
    fn flag_and_count_are_independent() {
        let controller = H160::repeat_byte(0xc0);
        let submitter = H160::repeat_byte(0xaa);
        let mut counter = counter(AcceptingLedger(0));

        let mut forwards = 0u64;
        let mut last_flag = false;
        // toggle, forward, toggle, toggle, forward, ...
        for step in 0..24u32 {
            if step % 3 == 0 {
                last_flag = step % 2 == 0;
                counter
                    .set_active(controller, submitter, last_flag)
                    .expect("toggle");
            } else {
                counter
                    .forward_attestation(submitter, &request())
                    .expect("forward");
                forwards += 1;
            }
        }

        assert_eq!(counter.get_count(submitter), U256::from(forwards));
        assert_eq!(counter.is_active(submitter), last_flag);
        assert_eq!(
            counter.get_info(submitter),
            (U256::from(forwards), last_flag)
        );
    }

    #[test]
    fn rejection_rolls_back_the_increment() {
        let mut counter = LedgerCounter::new(
            RejectingLedger(LedgerError::Rejected("no".to_string())),
            H160::repeat_byte(0x21),
            H160::repeat_byte(0xc0),
        )
        .expect("counter");
        let submitter = H160::repeat_byte(0xaa);

        for _ in 0..3 {
            counter
                .forward_attestation(submitter, &request())
                .unwrap_err();
        }
        assert_eq!(counter.get_count(submitter), U256::zero());
    }

    /// Rollback restores the flag bit as well as the count.
    #[test]
    fn rejection_preserves_active_flag() {
        let controller = H160::repeat_byte(0xc0);
        let submitter = H160::repeat_byte(0xaa);
        let mut counter = LedgerCounter::new(
            RejectingLedger(LedgerError::UnknownSchema(H256::zero())),
            H160::repeat_byte(0x21),
            controller,
        )
        .expect("counter");

        counter.set_active(controller, submitter, true).expect("on");
        counter
            .forward_attestation(submitter, &request())
            .unwrap_err();
        assert!(counter.is_active(submitter));
        assert_eq!(counter.get_count(submitter), U256::zero());
    }

    #[test]
    fn ledger_reason_passes_through_unmodified() {
        let reason = LedgerError::UnknownSchema(H256::repeat_byte(0x42));
        let mut counter = LedgerCounter::new(
            RejectingLedger(reason.clone()),
            H160::repeat_byte(0x21),
            H160::repeat_byte(0xc0),
        )
        .expect("counter");

        let err = counter
            .forward_attestation(H160::repeat_byte(0xaa), &request())
            .unwrap_err();
        assert_eq!(err, CounterError::Ledger(reason.clone()));
        assert_eq!(err.to_string(), reason.to_string());
    }

    #[test]
    fn count_saturates_at_the_mask_instead_of_wrapping() {
        let submitter = H160::repeat_byte(0xaa);
        let mut counter = counter(AcceptingLedger(0));

        let mut words = BTreeMap::new();
        words.insert(submitter, pack(true, U256::MAX >> 1));
        counter.restore(words);

        let err = counter
            .forward_attestation(submitter, &request())
            .unwrap_err();
        assert_eq!(err, CounterError::CounterOverflow(submitter));
        // Word untouched: still at max count with the flag set.
        assert_eq!(counter.get_count(submitter), U256::MAX >> 1);
        assert!(counter.is_active(submitter));
    }

    #[test]
    fn counters_are_per_caller() {
        let mut counter = counter(AcceptingLedger(0));
        let a = H160::repeat_byte(0xaa);
        let b = H160::repeat_byte(0xbb);

        counter.forward_attestation(a, &request()).expect("a");
        counter.forward_attestation(a, &request()).expect("a");
        counter.forward_attestation(b, &request()).expect("b");

        assert_eq!(counter.get_count(a), U256::from(2u8));
        assert_eq!(counter.get_count(b), U256::one());
    }
}
