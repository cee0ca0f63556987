//! Subcommand implementations.

pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod currency;

use thiserror::Error;
use urban_threads_storefront::StorefrontError;
use urban_threads_storefront::config::ConfigError;
use urban_threads_storefront::currency::PreferenceError;

/// Errors that can end a command.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{}", .0.user_message())]
    Storefront(#[from] StorefrontError),

    #[error("Could not save preference: {0}")]
    Preference(#[from] PreferenceError),

    #[error("Set STOREFRONT_EMAIL and STOREFRONT_PASSWORD (or pass --email/--password)")]
    MissingCredentials,

    #[error("Unsupported currency: {0}")]
    UnknownCurrency(String),

    #[error("No such line in the cart: {0}")]
    UnknownLine(String),
}
