//! Cart lines and the totals derived from them.

use serde::{Deserialize, Serialize};
use urban_threads_core::{BaseAmount, CartLineId, ProductId, UserId};

/// Product fields joined onto a cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: ProductId,
    pub name: String,
    pub price: BaseAmount,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
}

impl ProductSnapshot {
    pub const COLUMNS: &'static [&'static str] =
        &["id", "name", "price", "image_url", "stock_quantity"];
}

/// One distinct (product, size, color) selection in a shopper's cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: CartLineId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: u32,
    #[serde(default)]
    pub selected_size: Option<String>,
    #[serde(default)]
    pub selected_color: Option<String>,
    #[serde(rename = "products")]
    pub product: ProductSnapshot,
}

impl CartLine {
    pub const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "product_id",
        "quantity",
        "selected_size",
        "selected_color",
        "created_at",
    ];

    /// Unit price times quantity.
    #[must_use]
    pub fn subtotal(&self) -> BaseAmount {
        self.product.price.times(self.quantity)
    }

    /// Whether one more unit fits within known stock.
    #[must_use]
    pub fn can_increment(&self) -> bool {
        self.product
            .stock_quantity
            .is_none_or(|stock| i64::from(self.quantity) < stock)
    }

    /// Clamp a requested quantity to known stock.
    #[must_use]
    pub fn clamp_quantity(&self, requested: u32) -> u32 {
        match self.product.stock_quantity {
            Some(stock) => requested.min(u32::try_from(stock.max(0)).unwrap_or(u32::MAX)),
            None => requested,
        }
    }
}

/// Figures shown with the cart, always recomputed from the current lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CartTotals {
    pub subtotal: BaseAmount,
    pub shipping: BaseAmount,
    pub total: BaseAmount,
    /// Sum of quantities, shown on the cart badge.
    pub item_count: u32,
}

impl CartTotals {
    #[must_use]
    pub fn compute(lines: &[CartLine], shipping: BaseAmount) -> Self {
        let subtotal: BaseAmount = lines.iter().map(CartLine::subtotal).sum();
        Self {
            subtotal,
            shipping,
            total: subtotal + shipping,
            item_count: lines
                .iter()
                .map(|line| line.quantity)
                .fold(0, u32::saturating_add),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn line(id: &str, price: i64, quantity: u32, stock: Option<i64>) -> CartLine {
        serde_json::from_value(json!({
            "id": id,
            "user_id": "u-1",
            "product_id": format!("p-{id}"),
            "quantity": quantity,
            "selected_size": "M",
            "selected_color": null,
            "products": {
                "id": format!("p-{id}"),
                "name": "Linen Shirt",
                "price": price,
                "image_url": null,
                "stock_quantity": stock,
            },
        }))
        .unwrap()
    }

    #[test]
    fn test_totals() {
        let lines = [line("a", 89_000, 2, None), line("b", 35_000, 1, Some(3))];
        let totals = CartTotals::compute(&lines, BaseAmount::new(5_000));
        assert_eq!(totals.subtotal, BaseAmount::new(213_000));
        assert_eq!(totals.total, BaseAmount::new(218_000));
        assert_eq!(totals.item_count, 3);
    }

    #[test]
    fn test_empty_cart_totals() {
        let totals = CartTotals::compute(&[], BaseAmount::new(5_000));
        assert_eq!(totals.subtotal, BaseAmount::ZERO);
        assert_eq!(totals.item_count, 0);
    }

    #[test]
    fn test_increment_gating_and_clamp() {
        let limited = line("a", 100, 3, Some(3));
        assert!(!limited.can_increment());
        assert_eq!(limited.clamp_quantity(10), 3);

        let open = line("b", 100, 3, None);
        assert!(open.can_increment());
        assert_eq!(open.clamp_quantity(10), 10);
    }
}
