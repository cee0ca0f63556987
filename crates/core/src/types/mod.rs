//! Core types for Urban Threads.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod contact;
pub mod id;
pub mod price;
pub mod status;

pub use contact::{ContactError, Email, Phone, PostalCode, ShippingAddress};
pub use id::*;
pub use price::{BaseAmount, CurrencyCode, UnknownCurrency, format_price};
pub use status::*;
