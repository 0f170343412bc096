//! Property tests for fee arithmetic and transaction encoding.

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, U256};
    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::fees::{FeePolicy, FeeQuote};
    use crate::store::owner_key;
    use crate::transaction::{Call, FeeMode, NonceKey, UnsignedTransaction};

    const BOUND: u128 = u128::MAX / 1024;

    fn tx(nonce_key: NonceKey, nonce: u64, input: Vec<u8>) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: 42431,
            max_priority_fee_per_gas: 1_000_000,
            max_fee_per_gas: 4_000_000_000,
            gas_limit: 650_000,
            calls: vec![Call::new(Address::repeat_byte(0x42), U256::ZERO, Bytes::from(input))],
            nonce_key,
            nonce,
            valid_before: None,
            valid_after: None,
            fee_mode: FeeMode::Sponsored,
            fee_token: None,
            key_authorization: None,
        }
    }

    proptest! {
        #[test]
        fn test_bump_strictly_increases(prio in 0..BOUND, max in 0..BOUND) {
            let policy = FeePolicy::default();
            let quote = FeeQuote::new(prio, max);
            let next = quote.bumped(&policy);
            prop_assert!(next.max_priority_fee_per_gas > quote.max_priority_fee_per_gas);
            prop_assert!(next.max_fee_per_gas > quote.max_fee_per_gas);
            prop_assert!(next.max_fee_per_gas > next.max_priority_fee_per_gas);
        }

        #[test]
        fn test_quote_covers_priority(gas_price in 0..BOUND) {
            let policy = FeePolicy::default();
            let quote = FeeQuote::from_gas_price(gas_price, &policy);
            prop_assert!(quote.max_priority_fee_per_gas >= policy.min_priority_fee);
            prop_assert!(quote.max_fee_per_gas >= gas_price + quote.max_priority_fee_per_gas);
        }

        #[test]
        fn test_floor_merge_never_lowers(a in (0..BOUND, 0..BOUND), b in (0..BOUND, 0..BOUND)) {
            let merged = FeeQuote::new(a.0, a.1).max(FeeQuote::new(b.0, b.1));
            prop_assert!(merged.max_priority_fee_per_gas >= a.0.max(b.0));
            prop_assert!(merged.max_fee_per_gas >= a.1.max(b.1));
        }

        #[test]
        fn test_nonce_key_forms_hash_alike(n in any::<u64>(), pad in 0usize..24) {
            let mut raw = vec![0u8; pad];
            raw.extend_from_slice(&n.to_be_bytes());
            let seq = tx(NonceKey::Sequence(n), 1, vec![]);
            let raw = tx(NonceKey::from_be_bytes(&raw).unwrap(), 1, vec![]);
            prop_assert_eq!(seq.signature_hash(), raw.signature_hash());
        }

        #[test]
        fn test_digest_binds_nonce_and_input(nonce in 0u64..u64::MAX, input in proptest::collection::vec(any::<u8>(), 0..64)) {
            let base = tx(NonceKey::default(), nonce, input.clone());
            prop_assert_ne!(base.signature_hash(), tx(NonceKey::default(), nonce + 1, input.clone()).signature_hash());
            let mut other = input;
            other.push(0x01);
            prop_assert_ne!(base.signature_hash(), tx(NonceKey::default(), nonce, other).signature_hash());
        }

        #[test]
        fn test_owner_key_idempotent(addr in any::<[u8; 20]>(), upper in any::<bool>()) {
            let hex = format!("0x{}", hex::encode(addr));
            let hex = if upper { hex.to_uppercase().replacen("0X", "0x", 1) } else { hex };
            let once = owner_key(&hex);
            prop_assert_eq!(owner_key(&once), once.clone());
            prop_assert_eq!(once, hex::encode(addr));
        }
    }
}
