//! Placed orders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use urban_threads_core::{
    BaseAmount, OrderId, OrderLineId, OrderStatus, PaymentMethod, PaymentStatus, ProductId,
    ShippingAddress, UserId,
};

/// An order. Its address and lines are snapshots taken at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub total_amount: BaseAmount,
    pub status: OrderStatus,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "order_items")]
    pub lines: Vec<OrderLine>,
}

/// A product as it was bought: price, size and color are frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: BaseAmount,
    #[serde(default)]
    pub selected_size: Option<String>,
    #[serde(default)]
    pub selected_color: Option<String>,
}

impl OrderLine {
    #[must_use]
    pub fn subtotal(&self) -> BaseAmount {
        self.price.times(self.quantity)
    }
}
