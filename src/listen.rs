// src/listen.rs

//! Fan-out subscription to on-chain `Sync` events. Pool addresses are
//! partitioned into fixed-size batches; each batch owns one long-lived
//! websocket connection with a log filter over its addresses. A dropped
//! connection only ever takes its own batch down, and the owning task
//! reconnects after a fixed delay, forever, until shutdown.
//!
//! Inbound logs are deduplicated by transaction hash through a bounded
//! TTL cache, decoded, and dispatched to the evaluator under a small
//! concurrency cap so a burst of Syncs cannot pile up unbounded work.

use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Address, Filter, Log, H256, U256};
use futures::StreamExt;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    mask_url, Config, DEDUP_CAPACITY, DEDUP_TTL, DISPATCH_CONCURRENCY, RECONNECT_INTERVAL,
    SUBSCRIBE_STAGGER,
};
use crate::errors::ListenerError;
use crate::evaluate::ReserveSink;
use crate::store::Store;

const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(10);
const METRIC_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Reserve-update event emitted by every V2 pair whose reserves change.
#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "Sync", abi = "Sync(uint112,uint112)")]
pub struct SyncEvent {
    pub reserve0: U256,
    pub reserve1: U256,
}

#[derive(Clone)]
pub struct SyncListener {
    store: Arc<Store>,
    sink: Arc<dyn ReserveSink>,
    wss_url: String,
    batch_size: usize,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    seen_txs: Cache<H256, ()>,
    dispatch_permits: Arc<Semaphore>,
}

impl SyncListener {
    pub fn new(store: Arc<Store>, sink: Arc<dyn ReserveSink>, config: &Config) -> Self {
        Self {
            store,
            sink,
            wss_url: config.wss_url(),
            batch_size: config.batch_size,
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            seen_txs: Cache::builder()
                .max_capacity(DEDUP_CAPACITY)
                .time_to_live(DEDUP_TTL)
                .build(),
            dispatch_permits: Arc::new(Semaphore::new(DISPATCH_CONCURRENCY)),
        }
    }

    /// Open one subscription per address batch. Batches are staggered so a
    /// large catalog does not hammer the endpoint with simultaneous opens.
    pub async fn subscribe_all(&self) {
        let addresses = self.store.pool_addresses();
        let batches: Vec<Vec<Address>> = addresses
            .chunks(self.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        info!(
            target: "sync_listener",
            batches = batches.len(),
            pools = addresses.len(),
            "Opening Sync subscriptions."
        );

        let total = batches.len();
        let mut tasks = self.tasks.lock().await;
        for (idx, batch) in batches.into_iter().enumerate() {
            let listener = self.clone();
            tasks.push(tokio::spawn(async move {
                listener.run_batch(idx, batch).await;
            }));
            if idx + 1 < total {
                sleep(SUBSCRIBE_STAGGER).await;
            }
        }
    }

    /// Cancel every batch task and wait for them to drain.
    pub async fn shutdown(&self) {
        info!(target: "sync_listener", "Shutting down subscriptions.");
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            if timeout(SHUTDOWN_TASK_TIMEOUT, handle).await.is_err() {
                warn!(target: "sync_listener", "Batch task did not stop within timeout.");
            }
        }
    }

    /// Connection lifecycle for one batch: connect, stream until the
    /// connection dies, wait out the reconnect interval, repeat.
    async fn run_batch(&self, idx: usize, batch: Vec<Address>) {
        let filter = Filter::new()
            .address(batch)
            .topic0(SyncEvent::signature());

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(target: "sync_listener", batch = idx, "Subscription cancelled.");
                    break;
                }
                result = self.connect_and_stream(idx, &filter) => {
                    match result {
                        Ok(()) => warn!(
                            target: "sync_listener",
                            batch = idx,
                            "Sync stream ended. Reconnecting..."
                        ),
                        Err(e) => warn!(
                            target: "sync_listener",
                            batch = idx,
                            error = %e,
                            "Subscription dropped. Reconnecting..."
                        ),
                    }
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(RECONNECT_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self, idx: usize, filter: &Filter) -> Result<(), ListenerError> {
        let ws = Ws::connect(self.wss_url.as_str())
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;
        let provider = Provider::new(ws);
        let mut stream = provider
            .subscribe_logs(filter)
            .await
            .map_err(|e| ListenerError::Subscription(e.to_string()))?;
        info!(
            target: "sync_listener",
            batch = idx,
            url = %mask_url(&self.wss_url),
            "Subscribed to Sync logs."
        );

        let mut log_count: u64 = 0;
        let mut last_metric_report = Instant::now();
        while let Some(log) = stream.next().await {
            log_count += 1;
            if log_count % 1000 == 0 || last_metric_report.elapsed() > METRIC_REPORT_INTERVAL {
                let elapsed = last_metric_report.elapsed();
                let per_sec = log_count as f64 / elapsed.as_secs_f64().max(1e-6);
                info!(
                    target: "sync_listener::metrics",
                    batch = idx,
                    logs_processed = log_count,
                    logs_per_sec = %format!("{:.1}", per_sec),
                    "Sync log throughput."
                );
                last_metric_report = Instant::now();
                log_count = 0;
            }
            self.handle_log(log).await;
        }
        Ok(())
    }

    /// Dedup, decode, dispatch. Dispatch runs on its own task under the
    /// concurrency cap; the permit is released when the evaluation ends.
    async fn handle_log(&self, log: Log) {
        let Some(tx_hash) = log.transaction_hash else {
            debug!(target: "sync_listener", "Log without transaction hash, skipping.");
            return;
        };

        let entry = self.seen_txs.entry(tx_hash).or_insert(()).await;
        if !entry.is_fresh() {
            debug!(target: "sync_listener", tx = ?tx_hash, "Duplicate transaction, suppressed.");
            return;
        }

        let pool = log.address;
        let raw_log = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        let event = match <SyncEvent as EthEvent>::decode_log(&raw_log) {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    target: "sync_listener",
                    pool = ?pool,
                    error = %e,
                    "Undecodable Sync log, skipping."
                );
                return;
            }
        };

        let Ok(permit) = self.dispatch_permits.clone().acquire_owned().await else {
            return;
        };
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = sink
                .update_and_evaluate(pool, event.reserve0, event.reserve1)
                .await
            {
                error!(
                    target: "sync_listener",
                    pool = ?pool,
                    error = %e,
                    "Reserve update failed."
                );
            }
        });
    }
}
