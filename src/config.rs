// src/config.rs

//! Environment-driven configuration. Every recognized option has a default
//! except the Infura credential, which has to come from the environment (or
//! a `.env` file picked up by the supervisor before this runs).

use ethers::types::{Address, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::EngineError;

/// Aggregator contract exposing `viewPair(address[]) -> uint112[]`.
const DEFAULT_VIEWER_ADDRESS: &str = "0x416355755f32b2710ce38725ed0fa102ce7d07e6";

/// Delay before a dropped batch connection is reopened.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);
/// Pause between opening successive batch subscriptions, to stay under the
/// endpoint's connection-rate throttle.
pub const SUBSCRIBE_STAGGER: Duration = Duration::from_millis(100);
/// Upper bound on concurrently dispatched reserve updates.
pub const DISPATCH_CONCURRENCY: usize = 5;
/// Transaction-hash dedup cache bounds.
pub const DEDUP_CAPACITY: u64 = 100_000;
pub const DEDUP_TTL: Duration = Duration::from_millis(300_000);
/// Decimals of the base currency (WETH).
pub const BASE_DECIMALS: u8 = 18;

#[derive(Debug, Clone)]
pub struct Config {
    pub infura_api_key: String,
    pub web_server_port: u16,
    pub batch_size: usize,
    /// Hop input per cycle, in whole base-currency units.
    pub start_amount: U256,
    /// Base symbol used as both endpoints of every path description.
    pub start_currency: String,
    /// Per-hop fee in basis points, derived from `FEE_PERCENT`.
    pub fee_bps: u32,
    pub db_name: String,
    pub log_file_name: String,
    pub viewer_address: Address,
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        let infura_api_key = std::env::var("INFURA_API_KEY")
            .map_err(|_| EngineError::Config("INFURA_API_KEY is not set".to_string()))?;

        let fee_percent: f64 = env_or("FEE_PERCENT", "0.5")?;
        if !(0.0..=100.0).contains(&fee_percent) {
            return Err(EngineError::Config(format!(
                "FEE_PERCENT out of range: {fee_percent}"
            )));
        }

        let start_amount = {
            let raw = std::env::var("START_AMOUNT").unwrap_or_else(|_| "1".to_string());
            U256::from_dec_str(&raw)
                .map_err(|e| EngineError::Config(format!("invalid START_AMOUNT {raw:?}: {e}")))?
        };

        let viewer_address = {
            let raw = std::env::var("UNISWAP_VIEWER_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_VIEWER_ADDRESS.to_string());
            Address::from_str(&raw)
                .map_err(|e| EngineError::Config(format!("invalid UNISWAP_VIEWER_ADDRESS: {e}")))?
        };

        Ok(Self {
            infura_api_key,
            web_server_port: env_or("WEB_SERVER_PORT", "8080")?,
            batch_size: env_or("BATCH_SIZE", "800")?,
            start_amount,
            start_currency: std::env::var("START_CURRENCY").unwrap_or_else(|_| "WETH".to_string()),
            fee_bps: (fee_percent * 100.0).round() as u32,
            db_name: std::env::var("DB_NAME").unwrap_or_else(|_| "defi.db".to_string()),
            log_file_name: std::env::var("LOG_FILE_NAME")
                .unwrap_or_else(|_| "arbitrage.log".to_string()),
            viewer_address,
        })
    }

    pub fn https_url(&self) -> String {
        format!("https://mainnet.infura.io/v3/{}", self.infura_api_key)
    }

    pub fn wss_url(&self) -> String {
        format!("wss://mainnet.infura.io/ws/v3/{}", self.infura_api_key)
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| EngineError::Config(format!("invalid {key} {raw:?}: {e}")))
}

/// Strip credentials from an endpoint URL before it reaches a log line.
pub fn mask_url(url: &str) -> String {
    if let Some(scheme_pos) = url.find("://") {
        let scheme = &url[..scheme_pos];
        let rest = &url[scheme_pos + 3..];
        let host_end = rest.find('/').unwrap_or(rest.len());
        let host = &rest[..host_end];
        return format!("{scheme}://{host}/•••");
    }
    "•••".to_string()
}
