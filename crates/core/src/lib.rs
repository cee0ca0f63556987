//! Urban Threads Core - Shared types library.
//!
//! This crate provides common types used across all Urban Threads components:
//! - `storefront` - Client library for catalog, cart, checkout and account
//! - `cli` - Command-line driver for the storefront library
//!
//! # Architecture
//!
//! The core crate contains only types and pure functions - no I/O, no HTTP
//! clients, no caching. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for ids, base-currency amounts, currency
//!   formatting, contact details and statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
