//! Core domain types shared across the engine.
//!
//! Everything here is immutable after catalog load except pool reserves,
//! which live behind the store mutex (see `store::Store`). Addresses are
//! `ethers::types::Address` throughout, so case-insensitive equality and
//! hashing come for free; rendering is always `0x`-prefixed lowercase via
//! the `{:?}` / `{:x}` formatters.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// An ERC-20 token known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// A constant-product pair. `token1`/`token2` mirror the catalog columns;
/// reserves are kept separately under the store mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub address: Address,
    pub token1: Address,
    pub token2: Address,
}

/// Current reserves of one pool, in the pool's own token order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReserves {
    pub reserve1: U256,
    pub reserve2: U256,
}

impl PoolReserves {
    pub fn is_drained(&self) -> bool {
        self.reserve1.is_zero() || self.reserve2.is_zero()
    }
}

/// One hop of a cycle: swap through pool `lp`, receiving token `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStep {
    pub target: Address,
    pub lp: Address,
}

/// A pre-computed multi-hop route that starts and ends in the base
/// currency. The offline builder guarantees 2..=5 hops; the engine takes
/// whatever the catalog holds and simply prices it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub id: u64,
    pub steps: Vec<RouteStep>,
}

/// The repriced output of one cycle, produced by the evaluator and fanned
/// out to every connected observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateUpdate {
    pub path_id: String,
    pub path_description: String,
    pub rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_update_serde_round_trip() {
        let update = RateUpdate {
            path_id: "42".to_string(),
            path_description: "WETH -> DAI -> WETH".to_string(),
            rate: -0.004987562189054726,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"pathId\":\"42\""));
        assert!(json.contains("\"pathDescription\":\"WETH -> DAI -> WETH\""));
        let back: RateUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn drained_pool_detection() {
        let full = PoolReserves {
            reserve1: U256::from(1u64),
            reserve2: U256::from(1u64),
        };
        assert!(!full.is_drained());
        assert!(PoolReserves::default().is_drained());
        let half = PoolReserves {
            reserve1: U256::zero(),
            reserve2: U256::from(1000u64),
        };
        assert!(half.is_drained());
    }
}
