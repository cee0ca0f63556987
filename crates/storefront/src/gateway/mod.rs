//! Remote data gateway: the hosted backend's row store, stored procedures and
//! realtime change feed.
//!
//! # Architecture
//!
//! - [`Gateway`] is the only seam between the storefront and the backend.
//!   Everything above it (cache, cart controller, catalog, checkout) is
//!   written against the trait.
//! - [`SupabaseClient`] talks to the hosted backend over HTTP (`PostgREST`
//!   rows and `rpc/` procedures) and opens realtime channels through
//!   [`RealtimeClient`].
//! - [`memory::InMemoryBackend`] implements the same contract in process for
//!   tests (feature `testing`).
//!
//! Rows cross the seam as `serde_json::Value` and are decoded by the caller
//! with [`decode_rows`] / [`decode_row`].

#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod query;
pub mod realtime;
pub mod rest;

use std::future::Future;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use query::{
    ChangeEvent, ChangeKind, ChannelScope, Embed, Filter, FilterOp, Mutation, MutationKind,
    RowQuery, SortOrder,
};
pub use realtime::RealtimeClient;
pub use rest::{AuthTokens, SupabaseClient};

/// Errors that can occur when talking to the hosted backend.
///
/// Cloneable so a single failed fetch can be handed to every caller that
/// joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The request never produced a response (DNS, TLS, connection reset).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Backend-provided message, truncated.
        message: String,
    },

    /// The session token was rejected or has expired.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A stored procedure rejected its input (stock, selection validity).
    #[error("Procedure {name} failed: {message}")]
    Procedure {
        /// Procedure name.
        name: String,
        /// Backend-provided message.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A single-row lookup matched nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limited by the backend.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// The realtime channel closed or could not be joined.
    #[error("Realtime channel error: {0}")]
    Channel(String),
}

impl GatewayError {
    /// Whether this failure means the session can no longer be trusted.
    #[must_use]
    pub const fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Contract consumed by the storefront core.
///
/// Every method is a suspension point; nothing else in the storefront awaits
/// the network.
pub trait Gateway: Send + Sync + 'static {
    /// Fetch rows matching `query`.
    fn query(
        &self,
        query: &RowQuery,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, GatewayError>> + Send;

    /// Insert, update or delete rows. Returns the affected rows.
    fn mutate(
        &self,
        mutation: &Mutation,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, GatewayError>> + Send;

    /// Invoke a stored procedure.
    fn call_procedure(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, GatewayError>> + Send;

    /// Open a change feed for `scope`.
    ///
    /// The returned [`Subscription`] yields `None` once the channel drops;
    /// callers decide whether to resubscribe.
    fn subscribe(
        &self,
        scope: &ChannelScope,
    ) -> impl Future<Output = Result<Subscription, GatewayError>> + Send;
}

/// A live change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `pump`. The pump task is aborted on drop.
    #[must_use]
    pub const fn new(events: mpsc::Receiver<ChangeEvent>, pump: Option<JoinHandle<()>>) -> Self {
        Self { events, pump }
    }

    /// Wait for the next change. `None` means the channel dropped.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Decode a row set into typed rows.
///
/// # Errors
///
/// Returns [`GatewayError::Decode`] if any row does not match `T`.
pub fn decode_rows<T: DeserializeOwned>(
    rows: Vec<serde_json::Value>,
) -> Result<Vec<T>, GatewayError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(GatewayError::from))
        .collect()
}

/// Decode exactly one row, failing with `NotFound` on an empty set.
///
/// # Errors
///
/// Returns [`GatewayError::NotFound`] for an empty set or
/// [`GatewayError::Decode`] for a malformed row.
pub fn decode_row<T: DeserializeOwned>(
    rows: Vec<serde_json::Value>,
    what: &str,
) -> Result<T, GatewayError> {
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::NotFound(what.to_owned()))?;
    Ok(serde_json::from_value(row)?)
}
