// src/hydrate.rs

//! One-shot batched reserve hydration. Before any subscription opens, every
//! known pool gets its current reserves read through the aggregator
//! contract, `BATCH_SIZE` pools per call. A failed batch is logged and
//! skipped; its pools keep zero reserves until their first Sync arrives.

use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::HydrationBatchError;
use crate::store::Store;
use crate::types::PoolReserves;

abigen!(
    UniswapViewer,
    r#"[
        function viewPair(address[] pairs) external view returns (uint112[] reserves)
    ]"#,
);

/// Hydrate every pool in the store exactly once. Returns the number of
/// pools whose reserves were applied.
pub async fn hydrate<M: Middleware + 'static>(
    store: &Store,
    client: Arc<M>,
    viewer_address: Address,
    batch_size: usize,
) -> usize {
    let viewer = UniswapViewer::new(viewer_address, client);
    let addresses = store.pool_addresses();
    let mut hydrated = 0usize;
    let mut failed_batches = 0usize;

    for (idx, batch) in addresses.chunks(batch_size.max(1)).enumerate() {
        match fetch_batch(&viewer, batch).await {
            Ok(reserves) => {
                let mut guard = store.reserves().await;
                for (addr, res) in batch.iter().zip(reserves) {
                    if let Some(entry) = guard.get_mut(addr) {
                        *entry = res;
                    }
                }
                hydrated += batch.len();
            }
            Err(e) => {
                failed_batches += 1;
                warn!(
                    target: "hydrator",
                    batch = idx,
                    pools = batch.len(),
                    error = %e,
                    "Hydration batch failed, skipping."
                );
            }
        }
    }

    info!(
        target: "hydrator",
        hydrated,
        failed_batches,
        total = addresses.len(),
        "Reserve hydration complete."
    );
    hydrated
}

async fn fetch_batch<M: Middleware + 'static>(
    viewer: &UniswapViewer<M>,
    batch: &[Address],
) -> Result<Vec<PoolReserves>, HydrationBatchError> {
    let raw = viewer
        .view_pair(batch.to_vec())
        .call()
        .await
        .map_err(|e| HydrationBatchError::Call(e.to_string()))?;

    if raw.len() != batch.len() * 2 {
        return Err(HydrationBatchError::ShapeMismatch {
            expected: batch.len() * 2,
            got: raw.len(),
        });
    }

    Ok(raw
        .chunks(2)
        .map(|pair| PoolReserves {
            reserve1: U256::from(pair[0]),
            reserve2: U256::from(pair[1]),
        })
        .collect())
}
