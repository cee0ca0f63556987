//! Catalog products.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use urban_threads_core::{BaseAmount, ProductId};

use super::null_as_default;

/// A catalog entry. Read-only on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: BaseAmount,
    /// Pre-discount price, shown struck through when higher than `price`.
    #[serde(default)]
    pub original_price: Option<BaseAmount>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_new: bool,
    /// `None` means stock is not tracked.
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sizes: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub colors: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Product {
    /// Columns fetched for product cards and listings.
    pub const CARD_COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "price",
        "original_price",
        "image_url",
        "rating",
        "is_new",
        "stock_quantity",
        "category",
        "sizes",
        "colors",
    ];

    /// Stock is tracked and none is left.
    #[must_use]
    pub fn is_out_of_stock(&self) -> bool {
        self.stock_quantity.is_some_and(|stock| stock <= 0)
    }

    /// The original price is strictly higher than the current one.
    #[must_use]
    pub fn has_discount(&self) -> bool {
        self.original_price.is_some_and(|original| original > self.price)
    }

    #[must_use]
    pub fn requires_size(&self) -> bool {
        !self.sizes.is_empty()
    }

    #[must_use]
    pub fn requires_color(&self) -> bool {
        !self.colors.is_empty()
    }

    /// Highest quantity a shopper may pick, given a ceiling for untracked
    /// stock.
    #[must_use]
    pub fn max_quantity(&self, untracked_ceiling: u32) -> u32 {
        self.stock_quantity.map_or(untracked_ceiling, |stock| {
            u32::try_from(stock.max(0)).unwrap_or(u32::MAX)
        })
    }
}

/// Number of products in a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub product_count: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn product(value: serde_json::Value) -> Product {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_nulls_decode_to_defaults() {
        let p = product(json!({
            "id": "p-1",
            "name": "Linen Shirt",
            "price": 89_000,
            "is_new": null,
            "sizes": null,
            "colors": ["White"],
            "stock_quantity": null,
        }));
        assert!(!p.is_new);
        assert!(p.sizes.is_empty());
        assert!(!p.requires_size());
        assert!(p.requires_color());
        assert_eq!(p.stock_quantity, None);
    }

    #[test]
    fn test_stock_helpers() {
        let mut p = product(json!({ "id": "p-1", "name": "Tee", "price": 35_000 }));
        assert!(!p.is_out_of_stock());
        assert_eq!(p.max_quantity(99), 99);

        p.stock_quantity = Some(0);
        assert!(p.is_out_of_stock());
        assert_eq!(p.max_quantity(99), 0);

        p.stock_quantity = Some(4);
        assert_eq!(p.max_quantity(99), 4);
    }

    #[test]
    fn test_discount_requires_strictly_higher_original() {
        let mut p = product(json!({ "id": "p-1", "name": "Tee", "price": 35_000 }));
        assert!(!p.has_discount());
        p.original_price = Some(BaseAmount::new(35_000));
        assert!(!p.has_discount());
        p.original_price = Some(BaseAmount::new(45_000));
        assert!(p.has_discount());
    }
}
