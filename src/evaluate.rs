//! # Reserve Updates and Cycle Repricing
//!
//! The evaluator owns the write side of the store's reserve state. A single
//! call applies one pool's fresh reserves and reprices every cycle that
//! routes through that pool, all under one acquisition of the store mutex,
//! so each evaluation sees a self-consistent snapshot of the whole reserve
//! map.
//!
//! Pricing is pure 256-bit integer arithmetic with `U512` intermediates;
//! only the final rate is downshifted to a double for transport. Arithmetic
//! degeneracies (zero reserves, zero denominators, overflow past `U256`)
//! are not errors: they collapse the hop output to zero, and a zero rides
//! through the remaining hops on its own.

use async_trait::async_trait;
use ethers::types::{Address, I256, U256, U512};
use ethers::utils::format_units;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::{Config, BASE_DECIMALS};
use crate::errors::EngineError;
use crate::store::Store;
use crate::types::{Cycle, PoolReserves, RateUpdate};

/// Basis-point denominator for the per-hop fee.
const FEE_DENOMINATOR: u64 = 10_000;

/// The seam between the subscriber and the evaluator. Mocked in listener
/// tests so dispatch can be exercised without a live store.
#[async_trait]
pub trait ReserveSink: Send + Sync {
    async fn update_and_evaluate(
        &self,
        pool: Address,
        reserve1: U256,
        reserve2: U256,
    ) -> Result<(), EngineError>;
}

pub struct Evaluator {
    store: Arc<Store>,
    updates: broadcast::Sender<RateUpdate>,
    /// Cycle input in base-currency wei.
    start_wei: U256,
    fee_bps: u32,
    start_currency: String,
}

impl Evaluator {
    pub fn new(store: Arc<Store>, updates: broadcast::Sender<RateUpdate>, config: &Config) -> Self {
        Self {
            store,
            updates,
            start_wei: config
                .start_amount
                .saturating_mul(U256::exp10(BASE_DECIMALS as usize)),
            fee_bps: config.fee_bps,
            start_currency: config.start_currency.clone(),
        }
    }

    /// Wait out any in-flight critical section. Once this returns, no
    /// evaluation started before the call is still running.
    pub async fn quiesce(&self) {
        drop(self.store.reserves().await);
    }

    /// Run `cycle` on the reserve snapshot. `None` means the cycle
    /// references a pool the store has never heard of: it is skipped
    /// without emitting anything.
    fn amount_through_cycle(
        &self,
        cycle: &Cycle,
        reserves: &HashMap<Address, PoolReserves>,
    ) -> Option<U256> {
        let mut amount = self.start_wei;
        for step in &cycle.steps {
            let pool = self.store.pool(&step.lp)?;
            let res = reserves.get(&step.lp).copied()?;
            let (token_in, token_out, reserve_in, reserve_out) = if step.target == pool.token1 {
                (pool.token2, pool.token1, res.reserve2, res.reserve1)
            } else {
                (pool.token1, pool.token2, res.reserve1, res.reserve2)
            };
            if reserve_in.is_zero() || reserve_out.is_zero() {
                amount = U256::zero();
                continue;
            }
            amount = swap_out(
                amount,
                reserve_in,
                reserve_out,
                self.store.decimals(&token_in),
                self.store.decimals(&token_out),
                self.fee_bps,
            );
        }
        Some(amount)
    }

    /// `base -> t1 -> … -> base`, with the catalog placeholder standing in
    /// for any token that never made it into `TokenInfo`.
    fn describe(&self, cycle: &Cycle) -> String {
        let mut description = String::with_capacity(8 * (cycle.steps.len() + 1));
        description.push_str(&self.start_currency);
        for step in &cycle.steps {
            description.push_str(" -> ");
            description.push_str(self.store.symbol(&step.target));
        }
        description
    }

    fn rate(&self, final_amount: U256) -> f64 {
        // Interpret the difference as a signed 256-bit value; a drained
        // cycle prices at exactly -start_amount.
        let profit = I256::from_raw(final_amount.overflowing_sub(self.start_wei).0);
        format_units(profit, BASE_DECIMALS as u32)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ReserveSink for Evaluator {
    async fn update_and_evaluate(
        &self,
        pool: Address,
        reserve1: U256,
        reserve2: U256,
    ) -> Result<(), EngineError> {
        let mut reserves = self.store.reserves().await;
        let Some(entry) = reserves.get_mut(&pool) else {
            trace!(target: "evaluator", pool = ?pool, "Sync for unknown pool, ignoring.");
            return Ok(());
        };
        entry.reserve1 = reserve1;
        entry.reserve2 = reserve2;

        let Some(touched) = self.store.cycles_touching(&pool) else {
            return Ok(());
        };

        for id in touched {
            let Some(cycle) = self.store.cycle(*id) else {
                continue;
            };
            let Some(final_amount) = self.amount_through_cycle(cycle, &reserves) else {
                continue;
            };
            let update = RateUpdate {
                path_id: cycle.id.to_string(),
                path_description: self.describe(cycle),
                rate: self.rate(final_amount),
            };
            trace!(
                target: "evaluator",
                path_id = %update.path_id,
                rate = update.rate,
                "Cycle repriced."
            );
            self.updates
                .send(update)
                .map_err(|e| EngineError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}

/// One constant-product hop with decimal rescaling and the basis-point fee.
/// Input and input-side reserve are rescaled to the output token's
/// decimals before the swap; integer division truncates at every step.
pub(crate) fn swap_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    decimals_in: u8,
    decimals_out: u8,
    fee_bps: u32,
) -> U256 {
    let scale_num = U256::exp10(decimals_out as usize);
    let scale_den = U256::exp10(decimals_in as usize);

    let (x, reserve_in) = match (
        mul_div(amount_in, scale_num, scale_den),
        mul_div(reserve_in, scale_num, scale_den),
    ) {
        (Some(x), Some(r)) => (x, r),
        _ => return U256::zero(),
    };

    let fee_multiplier = U256::from(FEE_DENOMINATOR - fee_bps as u64);
    let Some(x_fee) = mul_div(x, fee_multiplier, U256::from(FEE_DENOMINATOR)) else {
        return U256::zero();
    };

    let denominator = reserve_in.saturating_add(x_fee);
    mul_div(x_fee, reserve_out, denominator).unwrap_or_else(U256::zero)
}

/// `a * b / denominator` through a `U512` intermediate. `None` on a zero
/// denominator or a quotient that no longer fits `U256`.
fn mul_div(a: U256, b: U256, denominator: U256) -> Option<U256> {
    if denominator.is_zero() {
        return None;
    }
    let product = U512::from(a).checked_mul(U512::from(b))?;
    let result = product / U512::from(denominator);
    if result > U512::from(U256::MAX) {
        return None;
    }
    U256::try_from(result).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pool, RouteStep, Token};
    use std::str::FromStr;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const POOL: &str = "0xa478c2975ab1ea89e8196811f51a7b7ade33eb11";

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    fn weth_token() -> Token {
        Token {
            address: addr(WETH),
            symbol: "WETH".into(),
            name: "Wrapped Ether".into(),
            decimals: 18,
        }
    }

    fn config(fee_percent: f64) -> Config {
        Config {
            infura_api_key: "test".into(),
            web_server_port: 8080,
            batch_size: 800,
            start_amount: U256::from(1u64),
            start_currency: "WETH".into(),
            fee_bps: (fee_percent * 100.0).round() as u32,
            db_name: "defi.db".into(),
            log_file_name: "arbitrage.log".into(),
            viewer_address: Address::zero(),
        }
    }

    /// One WETH/DAI pool, one two-hop cycle through it and back.
    fn round_trip_store() -> Arc<Store> {
        let dai = Token {
            address: addr(DAI),
            symbol: "DAI".into(),
            name: "Dai Stablecoin".into(),
            decimals: 18,
        };
        let pool = Pool {
            address: addr(POOL),
            token1: addr(WETH),
            token2: addr(DAI),
        };
        let cycle = Cycle {
            id: 1,
            steps: vec![
                RouteStep {
                    target: addr(DAI),
                    lp: addr(POOL),
                },
                RouteStep {
                    target: addr(WETH),
                    lp: addr(POOL),
                },
            ],
        };
        Arc::new(Store::from_parts(
            vec![weth_token(), dai],
            vec![pool],
            vec![cycle],
        ))
    }

    fn evaluator(store: Arc<Store>, fee_percent: f64) -> (Evaluator, broadcast::Receiver<RateUpdate>) {
        let (tx, rx) = broadcast::channel(64);
        (Evaluator::new(store, tx, &config(fee_percent)), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<RateUpdate>) -> Vec<RateUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[test]
    fn no_fee_equals_plain_constant_product() {
        let out = swap_out(
            U256::exp10(18),
            U256::from(10u64) * U256::exp10(18),
            U256::from(20_000u64) * U256::exp10(18),
            18,
            18,
            0,
        );
        // x * R_out / (R_in + x), no fee term anywhere.
        let expected = U256::exp10(18) * (U256::from(20_000u64) * U256::exp10(18))
            / (U256::from(11u64) * U256::exp10(18));
        assert_eq!(out, expected);
    }

    #[test]
    fn equal_decimals_apply_no_scaling() {
        let a = swap_out(
            U256::from(1_000_000u64),
            U256::from(5_000_000u64),
            U256::from(7_000_000u64),
            9,
            9,
            30,
        );
        let b = swap_out(
            U256::from(1_000_000u64),
            U256::from(5_000_000u64),
            U256::from(7_000_000u64),
            0,
            0,
            30,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn decimals_asymmetry_truncates_like_the_chain() {
        // 1 WETH into a (WETH[18], USDC[6]) pool holding 10 WETH / 20_000 USDC.
        let out = swap_out(
            U256::exp10(18),
            U256::from(10u64) * U256::exp10(18),
            U256::from(20_000u64) * U256::exp10(6),
            18,
            6,
            0,
        );
        assert_eq!(out, U256::from(1_818_181_818u64));
    }

    #[test]
    fn zero_reserve_kills_the_hop() {
        let out = swap_out(
            U256::exp10(18),
            U256::zero(),
            U256::from(1_000u64) * U256::exp10(18),
            18,
            18,
            0,
        );
        // swap_out itself divides by R_in + x_fee; the caller's zero-reserve
        // guard is what actually forces zero, so exercise that path too.
        assert_eq!(out, U256::zero());
    }

    #[tokio::test]
    async fn symmetric_pool_round_trip_is_flat_without_fee() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store.clone(), 0.0);

        // Reserves deep enough that two hops of price impact on 1 WETH
        // vanish below double precision noise.
        let depth = U256::from(1_000_000_000u64) * U256::exp10(18);
        eval.update_and_evaluate(addr(POOL), depth, depth)
            .await
            .unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        let rate = updates[0].rate;
        assert!(rate <= 0.0, "round trip cannot be profitable: {rate}");
        assert!(rate.abs() < 1e-8, "expected ~0, got {rate}");
    }

    #[tokio::test]
    async fn fee_makes_round_trip_strictly_negative() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store.clone(), 0.5);

        let depth = U256::from(1_000_000_000u64) * U256::exp10(18);
        eval.update_and_evaluate(addr(POOL), depth, depth)
            .await
            .unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].rate < 0.0);
        // Two hops at 50 bps each: 1 - 0.995^2 ≈ -0.9975%.
        assert!((updates[0].rate + 0.009975).abs() < 1e-4);
    }

    #[tokio::test]
    async fn drained_pool_prices_at_minus_one() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store.clone(), 0.5);

        eval.update_and_evaluate(
            addr(POOL),
            U256::zero(),
            U256::from(1_000u64) * U256::exp10(18),
        )
        .await
        .unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].rate, -1.0);
    }

    #[tokio::test]
    async fn repeated_update_is_idempotent() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store.clone(), 0.5);

        let r1 = U256::from(123_456u64) * U256::exp10(18);
        let r2 = U256::from(654_321u64) * U256::exp10(18);
        eval.update_and_evaluate(addr(POOL), r1, r2).await.unwrap();
        let first = drain(&mut rx);
        eval.update_and_evaluate(addr(POOL), r1, r2).await.unwrap();
        let second = drain(&mut rx);

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn description_has_one_symbol_per_hop_plus_base() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store.clone(), 0.5);

        eval.update_and_evaluate(addr(POOL), U256::exp10(18), U256::exp10(18))
            .await
            .unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates[0].path_description, "WETH -> DAI -> WETH");
        let cycle_len = store.cycle(1).unwrap().steps.len();
        assert_eq!(
            updates[0].path_description.split(" -> ").count(),
            cycle_len + 1
        );
    }

    #[tokio::test]
    async fn unknown_pool_update_is_a_noop() {
        let store = round_trip_store();
        let (eval, mut rx) = evaluator(store, 0.5);

        eval.update_and_evaluate(addr(USDC), U256::exp10(18), U256::exp10(18))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_target_token_renders_placeholder() {
        // Same pool, but DAI missing from TokenInfo: it prices with zero
        // decimals and renders as the placeholder symbol.
        let pool = Pool {
            address: addr(POOL),
            token1: addr(WETH),
            token2: addr(DAI),
        };
        let cycle = Cycle {
            id: 9,
            steps: vec![
                RouteStep {
                    target: addr(DAI),
                    lp: addr(POOL),
                },
                RouteStep {
                    target: addr(WETH),
                    lp: addr(POOL),
                },
            ],
        };
        let store = Arc::new(Store::from_parts(
            vec![weth_token()],
            vec![pool],
            vec![cycle],
        ));
        let (eval, mut rx) = evaluator(store, 0.5);

        eval.update_and_evaluate(
            addr(POOL),
            U256::from(1_000u64) * U256::exp10(18),
            U256::from(1_000u64) * U256::exp10(18),
        )
        .await
        .unwrap();

        let updates = drain(&mut rx);
        assert_eq!(updates[0].path_description, "WETH -> UNKNOWN -> WETH");
    }
}
