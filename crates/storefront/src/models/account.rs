//! Shopper profile and address book.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use urban_threads_core::{AddressId, ShippingAddress, UserId};

/// Profile row keyed by the auth user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Saved address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub user_id: UserId,
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub address_line_1: String,
    #[serde(default)]
    pub address_line_2: Option<String>,
    pub city: String,
    pub province: String,
    pub postal_code: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Address to be saved; built from a validated [`ShippingAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAddress {
    pub user_id: UserId,
    #[serde(flatten)]
    pub address: ShippingAddress,
    pub is_default: bool,
}
