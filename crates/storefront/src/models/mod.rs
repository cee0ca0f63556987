//! Rows read from the backend, decoded into typed models.

mod account;
mod cart;
mod order;
mod product;

pub use account::{Address, NewAddress, Profile};
pub use cart::{CartLine, CartTotals, ProductSnapshot};
pub use order::{Order, OrderLine};
pub use product::{CategoryCount, Product};

use serde::{Deserialize, Deserializer};

/// Treat an explicit `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
