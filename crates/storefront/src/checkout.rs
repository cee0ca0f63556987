//! Turning the cart into an order.
//!
//! Placing an order takes the authoritative cart lines, writes the order and
//! a snapshot of every line (price, size and color as they are now), then
//! empties the cart. Catalog changes made afterwards never touch the order.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};
use urban_threads_core::{
    ContactError, Email, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress,
};

use crate::account::Account;
use crate::cart::CartController;
use crate::error::{Result, StorefrontError, add_breadcrumb};
use crate::gateway::{Filter, Gateway, Mutation, decode_row, decode_rows};
use crate::models::{CartLine, CartTotals, Order, OrderLine};

/// Reasons checkout refuses to start.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Your cart is empty.")]
    EmptyCart,
    #[error("Please sign in to check out.")]
    NotSignedIn,
    #[error("Please check your details: {0}.")]
    InvalidField(#[from] ContactError),
    #[error("Please choose a payment method.")]
    UnknownPaymentMethod(String),
}

/// Checkout form as entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutForm {
    pub email: String,
    pub full_name: String,
    pub phone: String,
    pub address_line_1: String,
    pub address_line_2: String,
    pub city: String,
    pub province: String,
    pub postal_code: String,
    /// `credit_card` or `mobile_banking`.
    pub payment_method: String,
}

impl Default for CheckoutForm {
    fn default() -> Self {
        Self {
            email: String::new(),
            full_name: String::new(),
            phone: String::new(),
            address_line_1: String::new(),
            address_line_2: String::new(),
            city: String::new(),
            province: String::new(),
            postal_code: String::new(),
            payment_method: PaymentMethod::default().as_str().to_owned(),
        }
    }
}

/// A form that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidCheckout {
    pub email: Email,
    pub address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

impl CheckoutForm {
    /// Validate every field; the first failure is reported.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::InvalidField`] or
    /// [`CheckoutError::UnknownPaymentMethod`].
    pub fn validate(&self) -> std::result::Result<ValidCheckout, CheckoutError> {
        let email = Email::parse(&self.email)?;
        let address = ShippingAddress::parse(
            &self.full_name,
            &self.phone,
            &self.address_line_1,
            Some(&self.address_line_2),
            &self.city,
            &self.province,
            &self.postal_code,
        )?;
        let payment_method = self
            .payment_method
            .parse()
            .map_err(|_| CheckoutError::UnknownPaymentMethod(self.payment_method.clone()))?;
        Ok(ValidCheckout {
            email,
            address,
            payment_method,
        })
    }
}

/// Checkout for the signed-in shopper. Cheaply cloneable.
pub struct Checkout<G> {
    gateway: Arc<G>,
    cart: CartController<G>,
    account: Account<G>,
}

impl<G> Clone for Checkout<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            cart: self.cart.clone(),
            account: self.account.clone(),
        }
    }
}

impl<G: Gateway> Checkout<G> {
    #[must_use]
    pub const fn new(gateway: Arc<G>, cart: CartController<G>, account: Account<G>) -> Self {
        Self {
            gateway,
            cart,
            account,
        }
    }

    /// A form filled from the default address, or failing that the profile.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotSignedIn`] when signed out, or the
    /// gateway's error.
    pub async fn prefill(&self) -> Result<CheckoutForm> {
        let user = self
            .cart
            .session()
            .current_user()
            .ok_or(CheckoutError::NotSignedIn)?;
        let mut form = CheckoutForm {
            email: user.email.unwrap_or_default(),
            ..CheckoutForm::default()
        };

        if let Some(address) = self.account.default_address().await? {
            let profile_phone = match address.phone {
                Some(_) => None,
                None => self.account.profile().await?.phone,
            };
            form.full_name = address.full_name;
            form.phone = address.phone.or(profile_phone).unwrap_or_default();
            form.address_line_1 = address.address_line_1;
            form.address_line_2 = address.address_line_2.unwrap_or_default();
            form.city = address.city;
            form.province = address.province;
            form.postal_code = address.postal_code;
        } else {
            let profile = self.account.profile().await?;
            form.full_name = profile.full_name.unwrap_or_default();
            form.phone = profile.phone.unwrap_or_default();
        }
        Ok(form)
    }

    /// Place an order for everything in the cart.
    ///
    /// Refetches the cart first so the order reflects what the backend holds.
    /// If the order's lines cannot be written the order is cancelled. A
    /// failure to empty the cart afterwards is logged; the order stands.
    ///
    /// # Errors
    ///
    /// - [`CheckoutError`] for a signed-out shopper, an invalid form or an
    ///   empty cart; nothing is written
    /// - the gateway's error if the order could not be written
    #[instrument(skip(self, form))]
    pub async fn place_order(&self, form: &CheckoutForm) -> Result<Order> {
        let user = self
            .cart
            .session()
            .user_id()
            .ok_or(CheckoutError::NotSignedIn)?;
        let valid = form.validate()?;

        match self.cart.retry().await {
            Ok(_) | Err(StorefrontError::StaleResponse) => {}
            Err(e) => return Err(e),
        }
        let lines = self.cart.snapshot().lines;
        if lines.is_empty() {
            return Err(CheckoutError::EmptyCart.into());
        }
        let totals = CartTotals::compute(&lines, self.cart.shipping_fee());

        let insert = Mutation::insert(
            "orders",
            json!({
                "user_id": user.as_str(),
                "total_amount": totals.total,
                "status": OrderStatus::PendingPayment,
                "shipping_address": valid.address,
                "payment_method": valid.payment_method,
                "payment_status": PaymentStatus::Pending,
            }),
        );
        let mut order: Order = decode_row(self.gateway.mutate(&insert).await?, "order")?;

        let items = Mutation::insert("order_items", order_items(&order, &lines));
        match self.gateway.mutate(&items).await.and_then(decode_rows::<OrderLine>) {
            Ok(saved) => order.lines = saved,
            Err(e) => {
                self.cancel(&order).await;
                return Err(e.into());
            }
        }

        let empty_cart =
            Mutation::delete("cart_items").filter(Filter::eq("user_id", user.as_str()));
        if let Err(e) = self.gateway.mutate(&empty_cart).await {
            warn!(order_id = %order.id, error = %e, "Order placed but cart not emptied");
        }
        self.cart.invalidate().await;

        add_breadcrumb("checkout", "Order placed", &[("order_id", order.id.as_str())]);
        info!(
            order_id = %order.id,
            total = totals.total.units(),
            lines = order.lines.len(),
            "Order placed"
        );
        Ok(order)
    }

    async fn cancel(&self, order: &Order) {
        let update = Mutation::update("orders", json!({ "status": OrderStatus::Cancelled }))
            .filter(Filter::eq("id", order.id.as_str()));
        match self.gateway.mutate(&update).await {
            Ok(_) => warn!(order_id = %order.id, "Order lines not saved, order cancelled"),
            Err(e) => warn!(
                order_id = %order.id,
                error = %e,
                "Order lines not saved and order could not be cancelled"
            ),
        }
    }
}

fn order_items(order: &Order, lines: &[CartLine]) -> Value {
    Value::Array(
        lines
            .iter()
            .map(|line| {
                json!({
                    "order_id": order.id.as_str(),
                    "product_id": line.product_id.as_str(),
                    "quantity": line.quantity,
                    "price": line.product.price,
                    "selected_size": line.selected_size,
                    "selected_color": line.selected_color,
                })
            })
            .collect(),
    )
}
