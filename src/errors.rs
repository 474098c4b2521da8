//! # Centralized Error Handling
//!
//! Typed, hierarchical errors for the engine. Local failures (a hydration
//! batch, a dropped subscription, an undecodable log) carry their own types
//! and never escape their subsystem; everything that reaches `EngineError`
//! is fatal and terminates the process with exit code 1.

use ethers::types::Address;
use thiserror::Error;

/// The top-level error type. Anything that propagates this far takes the
/// whole engine down.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("Event channel closed: {0}")]
    Channel(String),
    #[error("Provider error: {0}")]
    Provider(String),
}

/// Failures while reading the materialized route catalog. All fatal at
/// startup: a partially-loaded catalog would silently drop cycles.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid address in catalog: {0:?}")]
    InvalidAddress(String),
    #[error("token {address} has out-of-range decimals {decimals}")]
    InvalidDecimals { address: String, decimals: i64 },
    #[error("route {id} has a malformed path: {reason}")]
    MalformedPath { id: i64, reason: String },
    #[error("route {id} references unknown pool {pool:?}")]
    UnknownPool { id: i64, pool: Address },
}

/// A single aggregator batch that failed during hydration. Logged and
/// skipped; the affected pools keep zero reserves until a Sync arrives.
#[derive(Error, Debug)]
pub enum HydrationBatchError {
    #[error("viewPair call failed: {0}")]
    Call(String),
    #[error("aggregator returned {got} reserves for {expected} pools")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Subscription-side failures. Every variant triggers a per-batch
/// reconnection; none of them stop the pipeline.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("log subscription failed: {0}")]
    Subscription(String),
}

/// Push-server failures. `Bind` is fatal at startup; everything else is
/// scoped to one observer, which gets dropped.
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("failed to bind web server port: {0}")]
    Bind(#[from] std::io::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
}
