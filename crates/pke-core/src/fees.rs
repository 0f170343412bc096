//! Fee quoting, underpriced-retry bumping and per-address fee floors.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeQuote {
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub bump_numerator: u128,
    pub bump_denominator: u128,
    /// Absolute lower bound on the priority fee of any quote.
    pub min_priority_fee: u128,
    /// Absolute lower bound on each bump step.
    pub min_bump: u128,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            bump_numerator: 12,
            bump_denominator: 10,
            min_priority_fee: 1_000_000,
            min_bump: 1_000_000,
        }
    }
}

impl FeeQuote {
    pub fn new(max_priority_fee_per_gas: u128, max_fee_per_gas: u128) -> Self {
        Self {
            max_priority_fee_per_gas,
            max_fee_per_gas,
        }
    }

    /// priority = max(gas_price / 5, min_priority_fee);
    /// max = max(gas_price * 4, gas_price + priority).
    pub fn from_gas_price(gas_price: u128, policy: &FeePolicy) -> Self {
        let priority = (gas_price / 5).max(policy.min_priority_fee);
        let max_fee = gas_price
            .saturating_mul(4)
            .max(gas_price.saturating_add(priority));
        Self::new(priority, max_fee)
    }

    /// Component-wise maximum.
    pub fn max(self, other: FeeQuote) -> FeeQuote {
        FeeQuote::new(
            self.max_priority_fee_per_gas.max(other.max_priority_fee_per_gas),
            self.max_fee_per_gas.max(other.max_fee_per_gas),
        )
    }

    /// Next bid after an underpriced rejection. Strictly greater in both
    /// components whenever `min_bump > 0`.
    pub fn bumped(&self, policy: &FeePolicy) -> FeeQuote {
        let step = |v: u128| {
            let proportional = v.saturating_mul(policy.bump_numerator) / policy.bump_denominator.max(1);
            proportional.max(v.saturating_add(policy.min_bump))
        };
        let priority = step(self.max_priority_fee_per_gas);
        let max_fee = step(self.max_fee_per_gas).max(priority.saturating_add(1));
        FeeQuote::new(priority, max_fee)
    }
}

// ============================================================================
// Fee Floor Cache
// ============================================================================

/// Last bid per sender. A fresh quote is never allowed below it.
#[derive(Debug, Default)]
pub struct FeeFloorCache {
    floors: Mutex<HashMap<Address, FeeQuote>>,
}

impl FeeFloorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `quote` to the remembered floor and remember the result.
    pub async fn merge(&self, address: &Address, quote: FeeQuote) -> FeeQuote {
        let mut floors = self.floors.lock().await;
        let merged = match floors.get(address) {
            Some(floor) => quote.max(*floor),
            None => quote,
        };
        floors.insert(*address, merged);
        merged
    }

    /// Bump `current` (merged with the floor first) and store it as the new floor.
    pub async fn bump(&self, address: &Address, current: FeeQuote, policy: &FeePolicy) -> FeeQuote {
        let mut floors = self.floors.lock().await;
        let base = match floors.get(address) {
            Some(floor) => current.max(*floor),
            None => current,
        };
        let next = base.bumped(policy);
        floors.insert(*address, next);
        debug!(
            address = %address,
            priority = next.max_priority_fee_per_gas,
            max_fee = next.max_fee_per_gas,
            "raised fee floor"
        );
        next
    }

    pub async fn floor(&self, address: &Address) -> Option<FeeQuote> {
        self.floors.lock().await.get(address).copied()
    }
}

// ============================================================================
// Per-Address Send Locks
// ============================================================================

/// Serializes nonce reads and submissions for one sender.
#[derive(Debug, Default)]
pub struct AddressLocks {
    locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, address: &Address) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(*address).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_from_gas_price() {
        let policy = FeePolicy::default();
        let q = FeeQuote::from_gas_price(1_000_000_000, &policy);
        assert_eq!(q.max_priority_fee_per_gas, 200_000_000);
        assert_eq!(q.max_fee_per_gas, 4_000_000_000);

        // Tiny gas price: priority floor dominates, max covers gas + priority.
        let q = FeeQuote::from_gas_price(10, &policy);
        assert_eq!(q.max_priority_fee_per_gas, 1_000_000);
        assert_eq!(q.max_fee_per_gas, 1_000_010);
    }

    #[test]
    fn test_bump_is_strict_and_respects_minimum() {
        let policy = FeePolicy::default();
        let q = FeeQuote::new(1_000_000, 2_000_000_000);
        let b = q.bumped(&policy);
        assert_eq!(b.max_priority_fee_per_gas, 2_000_000);
        assert_eq!(b.max_fee_per_gas, 2_400_000_000);

        let zero = FeeQuote::default().bumped(&policy);
        assert_eq!(zero.max_priority_fee_per_gas, 1_000_000);
        assert!(zero.max_fee_per_gas > zero.max_priority_fee_per_gas);
    }

    #[tokio::test]
    async fn test_floor_never_regresses() {
        let cache = FeeFloorCache::new();
        let policy = FeePolicy::default();
        let addr = Address::repeat_byte(7);

        let first = cache.merge(&addr, FeeQuote::new(5, 100)).await;
        let bumped = cache.bump(&addr, first, &policy).await;
        let fresh = cache.merge(&addr, FeeQuote::new(1, 50)).await;
        assert_eq!(fresh, bumped);
        assert_eq!(cache.floor(&addr).await, Some(bumped));
        assert_eq!(cache.floor(&Address::ZERO).await, None);
    }

    #[tokio::test]
    async fn test_address_lock_is_exclusive() {
        let locks = Arc::new(AddressLocks::new());
        let addr = Address::repeat_byte(1);
        let guard = locks.acquire(&addr).await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.acquire(&addr).await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();

        // Other addresses are independent.
        let _a = locks.acquire(&addr).await;
        let _b = locks.acquire(&Address::repeat_byte(2)).await;
    }
}
