//! # Catalog Store
//!
//! In-memory indexed snapshot of the route catalog: tokens, pools, and the
//! pre-computed cycles that reference them. Loaded exactly once at startup
//! from the sqlite file the offline route builder maintains; the connection
//! is closed before any other component starts.
//!
//! Immutable indexes are plain maps. The only mutable state, pool reserves,
//! sits behind a single `tokio::sync::Mutex`, which doubles as the
//! process-wide critical section for the evaluator: whoever holds the guard
//! sees a self-consistent snapshot of every reserve in the system.

use ethers::types::Address;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::errors::CatalogError;
use crate::types::{Cycle, Pool, PoolReserves, RouteStep, Token};

pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^0x[0-9a-f]{40}$").expect("address pattern is valid")
});

/// Normalize and validate a catalog address. Mixed-case input is lowered
/// first; anything that still fails the pattern is a catalog defect.
pub fn parse_address(raw: &str) -> Result<Address, CatalogError> {
    let normalized = raw.trim().to_lowercase();
    if !ADDRESS_RE.is_match(&normalized) {
        return Err(CatalogError::InvalidAddress(raw.to_string()));
    }
    Address::from_str(&normalized).map_err(|_| CatalogError::InvalidAddress(raw.to_string()))
}

#[derive(Debug)]
pub struct Store {
    tokens: HashMap<Address, Token>,
    pools: HashMap<Address, Pool>,
    cycles: HashMap<u64, Cycle>,
    pool_to_cycles: HashMap<Address, BTreeSet<u64>>,
    reserves: Mutex<HashMap<Address, PoolReserves>>,
}

impl Store {
    /// Read the full catalog from `db_name` and build every index. The
    /// sqlite pool is closed before this returns.
    pub async fn load(db_name: &str) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::new()
            .filename(db_name)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::load_from_pool(&pool).await;
        pool.close().await;
        store
    }

    /// Load from an already-open catalog pool. Split out of [`Store::load`]
    /// so fixtures can drive it with an in-memory database.
    pub async fn load_from_pool(pool: &SqlitePool) -> Result<Self, CatalogError> {
        let mut tokens = Vec::new();
        for row in sqlx::query("SELECT address, symbol, name, decimals FROM TokenInfo")
            .fetch_all(pool)
            .await?
        {
            let raw_address: String = row.try_get("address")?;
            let decimals: i64 = row.try_get("decimals")?;
            if !(0..=30).contains(&decimals) {
                return Err(CatalogError::InvalidDecimals {
                    address: raw_address,
                    decimals,
                });
            }
            tokens.push(Token {
                address: parse_address(&raw_address)?,
                symbol: row.try_get("symbol")?,
                name: row.try_get("name")?,
                decimals: decimals as u8,
            });
        }

        let mut pools = Vec::new();
        for row in sqlx::query("SELECT address, token1_address, token2_address FROM LPInfo")
            .fetch_all(pool)
            .await?
        {
            let raw_address: String = row.try_get("address")?;
            let raw_token1: String = row.try_get("token1_address")?;
            let raw_token2: String = row.try_get("token2_address")?;
            pools.push(Pool {
                address: parse_address(&raw_address)?,
                token1: parse_address(&raw_token1)?,
                token2: parse_address(&raw_token2)?,
            });
        }

        let mut cycles = Vec::new();
        for row in sqlx::query("SELECT id, path FROM Route ORDER BY id")
            .fetch_all(pool)
            .await?
        {
            let id: i64 = row.try_get("id")?;
            let path: String = row.try_get("path")?;
            cycles.push(parse_route(id, &path)?);
        }

        Self::assemble(tokens, pools, cycles)
    }

    fn assemble(
        tokens: Vec<Token>,
        pools: Vec<Pool>,
        cycles: Vec<Cycle>,
    ) -> Result<Self, CatalogError> {
        let tokens: HashMap<Address, Token> =
            tokens.into_iter().map(|t| (t.address, t)).collect();
        let pools: HashMap<Address, Pool> =
            pools.into_iter().map(|p| (p.address, p)).collect();

        let mut pool_to_cycles: HashMap<Address, BTreeSet<u64>> = HashMap::new();
        for cycle in &cycles {
            for step in &cycle.steps {
                if !pools.contains_key(&step.lp) {
                    return Err(CatalogError::UnknownPool {
                        id: cycle.id as i64,
                        pool: step.lp,
                    });
                }
                pool_to_cycles.entry(step.lp).or_default().insert(cycle.id);
            }
        }

        let reserves = pools
            .keys()
            .map(|addr| (*addr, PoolReserves::default()))
            .collect();

        let cycles: HashMap<u64, Cycle> = cycles.into_iter().map(|c| (c.id, c)).collect();

        info!(
            target: "store",
            tokens = tokens.len(),
            pools = pools.len(),
            cycles = cycles.len(),
            "Catalog loaded."
        );

        Ok(Self {
            tokens,
            pools,
            cycles,
            pool_to_cycles,
            reserves: Mutex::new(reserves),
        })
    }

    pub fn token(&self, address: &Address) -> Option<&Token> {
        self.tokens.get(address)
    }

    /// Symbol for `address`, or the catalog-wide placeholder when the token
    /// never made it into `TokenInfo`.
    pub fn symbol(&self, address: &Address) -> &str {
        self.tokens
            .get(address)
            .map(|t| t.symbol.as_str())
            .unwrap_or(UNKNOWN_SYMBOL)
    }

    /// Unknown tokens price as zero-decimal, matching how they render.
    pub fn decimals(&self, address: &Address) -> u8 {
        self.tokens.get(address).map(|t| t.decimals).unwrap_or(0)
    }

    pub fn pool(&self, address: &Address) -> Option<&Pool> {
        self.pools.get(address)
    }

    pub fn cycle(&self, id: u64) -> Option<&Cycle> {
        self.cycles.get(&id)
    }

    /// Ordered ids of every cycle that routes through `pool`.
    pub fn cycles_touching(&self, pool: &Address) -> Option<&BTreeSet<u64>> {
        self.pool_to_cycles.get(pool)
    }

    pub fn pool_addresses(&self) -> Vec<Address> {
        self.pools.keys().copied().collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn cycle_count(&self) -> usize {
        self.cycles.len()
    }

    /// Exclusive access to the reserve map. This is the evaluator's
    /// critical section: hold the guard across the write and every cycle
    /// evaluation it triggers, and never await while holding it.
    pub async fn reserves(&self) -> MutexGuard<'_, HashMap<Address, PoolReserves>> {
        self.reserves.lock().await
    }

    #[cfg(test)]
    pub(crate) fn from_parts(tokens: Vec<Token>, pools: Vec<Pool>, cycles: Vec<Cycle>) -> Self {
        Self::assemble(tokens, pools, cycles).expect("test catalog is well-formed")
    }
}

/// Parse one `Route.path` column: JSON of shape `[[target, [lp]], …]`.
fn parse_route(id: i64, path: &str) -> Result<Cycle, CatalogError> {
    let raw: Vec<(String, Vec<String>)> =
        serde_json::from_str(path).map_err(|e| CatalogError::MalformedPath {
            id,
            reason: e.to_string(),
        })?;

    let mut steps = Vec::with_capacity(raw.len());
    for (target, lps) in raw {
        let lp = lps.first().ok_or_else(|| CatalogError::MalformedPath {
            id,
            reason: "step has no pool".to_string(),
        })?;
        steps.push(RouteStep {
            target: parse_address(&target)?,
            lp: parse_address(lp)?,
        });
    }

    if steps.is_empty() {
        return Err(CatalogError::MalformedPath {
            id,
            reason: "empty path".to_string(),
        });
    }

    Ok(Cycle {
        id: id as u64,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const POOL_A: &str = "0xa478c2975ab1ea89e8196811f51a7b7ade33eb11";
    const POOL_B: &str = "0xb478c2975ab1ea89e8196811f51a7b7ade33eb11";

    async fn fixture_pool() -> SqlitePool {
        // One connection only: every pooled connection to :memory: would
        // otherwise see its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for ddl in [
            "CREATE TABLE TokenInfo (address TEXT PRIMARY KEY, symbol TEXT, name TEXT, decimals INTEGER)",
            "CREATE TABLE LPInfo (address TEXT PRIMARY KEY, token1_address TEXT, token2_address TEXT)",
            "CREATE TABLE Route (id INTEGER PRIMARY KEY, path TEXT, created_at DATETIME)",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        pool
    }

    async fn insert_token(pool: &SqlitePool, address: &str, symbol: &str, decimals: i64) {
        sqlx::query("INSERT INTO TokenInfo VALUES (?, ?, ?, ?)")
            .bind(address)
            .bind(symbol)
            .bind(symbol)
            .bind(decimals)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn insert_lp(pool: &SqlitePool, address: &str, token1: &str, token2: &str) {
        sqlx::query("INSERT INTO LPInfo VALUES (?, ?, ?)")
            .bind(address)
            .bind(token1)
            .bind(token2)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn insert_route(pool: &SqlitePool, id: i64, path: &str) {
        sqlx::query("INSERT INTO Route (id, path) VALUES (?, ?)")
            .bind(id)
            .bind(path)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn loads_catalog_and_builds_indexes() {
        let db = fixture_pool().await;
        insert_token(&db, WETH, "WETH", 18).await;
        insert_token(&db, DAI, "DAI", 18).await;
        insert_lp(&db, POOL_A, WETH, DAI).await;
        insert_lp(&db, POOL_B, WETH, DAI).await;
        insert_route(
            &db,
            7,
            &format!(r#"[["{DAI}", ["{POOL_A}"]], ["{WETH}", ["{POOL_B}"]]]"#),
        )
        .await;

        let store = Store::load_from_pool(&db).await.unwrap();
        assert_eq!(store.pool_count(), 2);
        assert_eq!(store.cycle_count(), 1);

        let cycle = store.cycle(7).unwrap();
        assert_eq!(cycle.steps.len(), 2);
        assert_eq!(cycle.steps[0].target, parse_address(DAI).unwrap());

        let pool_a = parse_address(POOL_A).unwrap();
        let touching: Vec<u64> = store
            .cycles_touching(&pool_a)
            .unwrap()
            .iter()
            .copied()
            .collect();
        assert_eq!(touching, vec![7]);

        // Reserves start at zero for every pool.
        let reserves = store.reserves().await;
        assert!(reserves[&pool_a].is_drained());
    }

    #[tokio::test]
    async fn mixed_case_addresses_normalize_on_ingress() {
        let db = fixture_pool().await;
        insert_token(&db, &WETH.to_uppercase().replace("0X", "0x"), "WETH", 18).await;
        insert_lp(&db, POOL_A, WETH, DAI).await;

        let store = Store::load_from_pool(&db).await.unwrap();
        let weth = parse_address(WETH).unwrap();
        assert_eq!(store.symbol(&weth), "WETH");
    }

    #[tokio::test]
    async fn rejects_route_through_unknown_pool() {
        let db = fixture_pool().await;
        insert_token(&db, WETH, "WETH", 18).await;
        insert_lp(&db, POOL_A, WETH, DAI).await;
        insert_route(&db, 1, &format!(r#"[["{DAI}", ["{POOL_B}"]]]"#)).await;

        match Store::load_from_pool(&db).await {
            Err(CatalogError::UnknownPool { id: 1, .. }) => {}
            other => panic!("expected UnknownPool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_path_json() {
        let db = fixture_pool().await;
        insert_lp(&db, POOL_A, WETH, DAI).await;
        insert_route(&db, 3, "not json at all").await;

        match Store::load_from_pool(&db).await {
            Err(CatalogError::MalformedPath { id: 3, .. }) => {}
            other => panic!("expected MalformedPath, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        let db = fixture_pool().await;
        insert_token(&db, "0x1234", "BAD", 18).await;

        match Store::load_from_pool(&db).await {
            Err(CatalogError::InvalidAddress(raw)) => assert_eq!(raw, "0x1234"),
            other => panic!("expected InvalidAddress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_out_of_range_decimals() {
        let db = fixture_pool().await;
        insert_token(&db, WETH, "WETH", 31).await;

        match Store::load_from_pool(&db).await {
            Err(CatalogError::InvalidDecimals { decimals: 31, .. }) => {}
            other => panic!("expected InvalidDecimals, got {other:?}"),
        }
    }

    #[test]
    fn unknown_token_renders_placeholder() {
        let store = Store::from_parts(vec![], vec![], vec![]);
        let addr = parse_address(WETH).unwrap();
        assert_eq!(store.symbol(&addr), UNKNOWN_SYMBOL);
        assert_eq!(store.decimals(&addr), 0);
    }
}
