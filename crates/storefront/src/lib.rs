//! Urban Threads storefront library.
//!
//! Catalog browsing, a server-authoritative cart kept in sync over realtime
//! channels, checkout, account management and display-currency preference,
//! all written against the [`gateway::Gateway`] seam so the same code runs
//! against the hosted backend or the in-memory backend used in tests.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod account;
pub mod cache;
pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod config;
pub mod currency;
pub mod error;
pub mod gateway;
pub mod models;
pub mod retry;
pub mod selection;
pub mod session;
pub mod state;
pub mod telemetry;

pub use error::{Result, StorefrontError};
pub use state::Storefront;
