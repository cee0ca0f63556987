//! Size, color and quantity picked for one product before adding it to the
//! cart.
//!
//! A [`ProductSelection`] is opened per product and reset each time it is
//! opened. Nothing is sent to the backend until [`ProductSelection::validate`]
//! passes: first the shopper must be signed in, then a size must be chosen if
//! the product has sizes, then a color if it has colors.
//!
//! While an add is in flight the selection is marked submitting; watch it
//! with [`ProductSelection::watch_submitting`] to disable the add control.
//! A second submission is refused until the first one finishes or is
//! dropped.

use thiserror::Error;
use tokio::sync::watch;

use crate::cart::CartController;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::models::Product;

/// Quantity ceiling for products whose stock is not tracked.
pub const FALLBACK_MAX_QUANTITY: u32 = 99;

/// Client-side reasons an add-to-cart request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Please sign in to add items to your cart.")]
    NotSignedIn,
    #[error("Please choose a size.")]
    SizeRequired,
    #[error("Please choose a color.")]
    ColorRequired,
    #[error("That size is not available for this product.")]
    UnknownSize,
    #[error("That color is not available for this product.")]
    UnknownColor,
    #[error("Quantity must be at least 1.")]
    InvalidQuantity,
    #[error("This product is out of stock.")]
    OutOfStock,
    #[error("Already adding this to your cart.")]
    AlreadySubmitting,
}

/// A validated add-to-cart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequest {
    pub quantity: u32,
    pub size: Option<String>,
    pub color: Option<String>,
}

impl LineRequest {
    /// Check a request against the product's declared options.
    ///
    /// # Errors
    ///
    /// Returns the first failing check, in the order quantity, size, color.
    pub fn check(&self, product: &Product) -> std::result::Result<(), SelectionError> {
        if self.quantity < 1 {
            return Err(SelectionError::InvalidQuantity);
        }
        check_option(&product.sizes, self.size.as_deref()).map_err(|missing| {
            if missing {
                SelectionError::SizeRequired
            } else {
                SelectionError::UnknownSize
            }
        })?;
        check_option(&product.colors, self.color.as_deref()).map_err(|missing| {
            if missing {
                SelectionError::ColorRequired
            } else {
                SelectionError::UnknownColor
            }
        })
    }
}

/// `Err(true)` when a required option is missing, `Err(false)` when the
/// chosen value is not offered.
fn check_option(offered: &[String], chosen: Option<&str>) -> std::result::Result<(), bool> {
    match chosen {
        None if offered.is_empty() => Ok(()),
        None => Err(true),
        Some(value) if offered.iter().any(|o| o == value) => Ok(()),
        Some(_) => Err(false),
    }
}

/// Transient selection state for one product.
#[derive(Debug)]
pub struct ProductSelection {
    product: Product,
    size: Option<String>,
    color: Option<String>,
    quantity: u32,
    submitting: watch::Sender<bool>,
    open: bool,
}

/// Clears the submitting flag when the add finishes or its future is dropped.
struct Submitting<'a>(&'a watch::Sender<bool>);

impl Drop for Submitting<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl ProductSelection {
    /// Open a selection with the product's first size and color preselected.
    #[must_use]
    pub fn open(product: Product) -> Self {
        let mut selection = Self {
            product,
            size: None,
            color: None,
            quantity: 1,
            submitting: watch::Sender::new(false),
            open: false,
        };
        selection.reopen();
        selection
    }

    /// Reset to the defaults, as if freshly opened.
    pub fn reopen(&mut self) {
        self.size = self.product.sizes.first().cloned();
        self.color = self.product.colors.first().cloned();
        self.quantity = 1;
        self.submitting.send_replace(false);
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    #[must_use]
    pub const fn product(&self) -> &Product {
        &self.product
    }

    #[must_use]
    pub fn size(&self) -> Option<&str> {
        self.size.as_deref()
    }

    #[must_use]
    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    #[must_use]
    pub fn is_submitting(&self) -> bool {
        *self.submitting.borrow()
    }

    /// Follow the submitting flag, e.g. to disable the add control.
    #[must_use]
    pub fn watch_submitting(&self) -> watch::Receiver<bool> {
        self.submitting.subscribe()
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Upper bound for the quantity picker.
    #[must_use]
    pub fn max_quantity(&self) -> u32 {
        self.product.max_quantity(FALLBACK_MAX_QUANTITY).max(1)
    }

    /// Choose a size. `None` clears it.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::UnknownSize`] if the product does not offer it.
    pub fn choose_size(&mut self, size: Option<&str>) -> std::result::Result<(), SelectionError> {
        if let Some(size) = size
            && !self.product.sizes.iter().any(|s| s == size)
        {
            return Err(SelectionError::UnknownSize);
        }
        self.size = size.map(str::to_owned);
        Ok(())
    }

    /// Choose a color. `None` clears it.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::UnknownColor`] if the product does not offer it.
    pub fn choose_color(&mut self, color: Option<&str>) -> std::result::Result<(), SelectionError> {
        if let Some(color) = color
            && !self.product.colors.iter().any(|c| c == color)
        {
            return Err(SelectionError::UnknownColor);
        }
        self.color = color.map(str::to_owned);
        Ok(())
    }

    /// One more, unless already at the bound. Returns whether it changed.
    pub fn increment(&mut self) -> bool {
        if self.quantity >= self.max_quantity() {
            return false;
        }
        self.quantity += 1;
        true
    }

    /// One fewer, never below 1. Returns whether it changed.
    pub fn decrement(&mut self) -> bool {
        if self.quantity <= 1 {
            return false;
        }
        self.quantity -= 1;
        true
    }

    /// Set the quantity directly, clamped to `1..=max_quantity`.
    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity.clamp(1, self.max_quantity());
    }

    /// Check the submission preconditions in order: signed in, size, color.
    ///
    /// # Errors
    ///
    /// Returns the first precondition that fails.
    pub fn validate(&self, signed_in: bool) -> std::result::Result<LineRequest, SelectionError> {
        if !signed_in {
            return Err(SelectionError::NotSignedIn);
        }
        let request = LineRequest {
            quantity: self.quantity,
            size: self.size.clone(),
            color: self.color.clone(),
        };
        request.check(&self.product)?;
        if self.product.is_out_of_stock() {
            return Err(SelectionError::OutOfStock);
        }
        Ok(request)
    }

    /// Validate and mark the selection as submitting.
    ///
    /// Callers that drive the add themselves must follow up with
    /// [`ProductSelection::finish`].
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::AlreadySubmitting`] while an earlier add is
    /// in flight, otherwise the first failing precondition.
    pub fn begin(&self, signed_in: bool) -> std::result::Result<LineRequest, SelectionError> {
        if self.is_submitting() {
            return Err(SelectionError::AlreadySubmitting);
        }
        let request = self.validate(signed_in)?;
        self.submitting.send_replace(true);
        Ok(request)
    }

    /// Clear the submitting flag; close the selection if the add succeeded.
    pub fn finish<T, E>(&mut self, result: &std::result::Result<T, E>) {
        self.submitting.send_replace(false);
        if result.is_ok() {
            self.close();
        }
    }

    /// Validate and add to the cart.
    ///
    /// On success the selection closes. On failure it stays open with every
    /// choice intact so the shopper can retry. Dropping the returned future
    /// mid-flight clears the submitting flag.
    ///
    /// # Errors
    ///
    /// Returns a validation error without calling the backend, or the cart's
    /// error if adding failed.
    pub async fn submit<G: Gateway>(&mut self, cart: &CartController<G>) -> Result<()> {
        let request = self.begin(cart.session().is_authenticated())?;
        let result = {
            let _submitting = Submitting(&self.submitting);
            cart.add_line(&self.product, &request).await
        };
        self.finish(&result);
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn product(sizes: &[&str], colors: &[&str], stock: Option<i64>) -> Product {
        serde_json::from_value(json!({
            "id": "p-1",
            "name": "Oversized Tee",
            "price": 59_000,
            "sizes": sizes,
            "colors": colors,
            "stock_quantity": stock,
        }))
        .unwrap()
    }

    #[test]
    fn test_open_preselects_first_options() {
        let selection = ProductSelection::open(product(&["S", "M"], &["Black", "White"], None));
        assert_eq!(selection.size(), Some("S"));
        assert_eq!(selection.color(), Some("Black"));
        assert_eq!(selection.quantity(), 1);
        assert!(selection.is_open());

        let plain = ProductSelection::open(product(&[], &[], None));
        assert_eq!(plain.size(), None);
        assert_eq!(plain.color(), None);
    }

    #[test]
    fn test_reopen_resets_choices() {
        let mut selection = ProductSelection::open(product(&["S", "M"], &[], None));
        selection.choose_size(Some("M")).unwrap();
        selection.increment();
        selection.close();

        selection.reopen();
        assert_eq!(selection.size(), Some("S"));
        assert_eq!(selection.quantity(), 1);
    }

    #[test]
    fn test_quantity_bounded_by_stock() {
        let mut selection = ProductSelection::open(product(&[], &[], Some(2)));
        assert!(!selection.decrement());
        assert!(selection.increment());
        assert!(!selection.increment());
        assert_eq!(selection.quantity(), 2);
    }

    #[test]
    fn test_quantity_bounded_by_fallback_when_untracked() {
        let mut selection = ProductSelection::open(product(&[], &[], None));
        selection.set_quantity(500);
        assert_eq!(selection.quantity(), FALLBACK_MAX_QUANTITY);
        assert!(!selection.increment());
        selection.set_quantity(0);
        assert_eq!(selection.quantity(), 1);
    }

    #[test]
    fn test_auth_checked_before_size() {
        let mut selection = ProductSelection::open(product(&["S", "M"], &[], None));
        selection.choose_size(None).unwrap();

        assert_eq!(selection.validate(false), Err(SelectionError::NotSignedIn));
        assert_eq!(selection.validate(true), Err(SelectionError::SizeRequired));
    }

    #[test]
    fn test_size_checked_before_color() {
        let mut selection = ProductSelection::open(product(&["S"], &["Red"], None));
        selection.choose_size(None).unwrap();
        selection.choose_color(None).unwrap();
        assert_eq!(selection.validate(true), Err(SelectionError::SizeRequired));

        selection.choose_size(Some("S")).unwrap();
        assert_eq!(selection.validate(true), Err(SelectionError::ColorRequired));

        selection.choose_color(Some("Red")).unwrap();
        let request = selection.validate(true).unwrap();
        assert_eq!(request.size.as_deref(), Some("S"));
        assert_eq!(request.color.as_deref(), Some("Red"));
    }

    #[test]
    fn test_messages_are_distinct() {
        let messages = [
            SelectionError::NotSignedIn,
            SelectionError::SizeRequired,
            SelectionError::ColorRequired,
        ]
        .map(|e| e.to_string());
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut selection = ProductSelection::open(product(&["S"], &[], None));
        assert_eq!(
            selection.choose_size(Some("XXL")),
            Err(SelectionError::UnknownSize)
        );
        assert_eq!(selection.size(), Some("S"));
        assert_eq!(
            selection.choose_color(Some("Red")),
            Err(SelectionError::UnknownColor)
        );
    }

    #[test]
    fn test_line_request_check() {
        let tee = product(&["M"], &[], None);
        let request = LineRequest {
            quantity: 0,
            size: Some("M".to_owned()),
            color: None,
        };
        assert_eq!(request.check(&tee), Err(SelectionError::InvalidQuantity));

        let request = LineRequest {
            quantity: 2,
            size: Some("M".to_owned()),
            color: Some("Blue".to_owned()),
        };
        assert_eq!(request.check(&tee), Err(SelectionError::UnknownColor));
    }

    #[test]
    fn test_second_submit_refused_until_finished() {
        let mut selection = ProductSelection::open(product(&["S"], &[], None));
        let submitting = selection.watch_submitting();

        let request = selection.begin(true).unwrap();
        assert_eq!(request.size.as_deref(), Some("S"));
        assert!(selection.is_submitting());
        assert!(*submitting.borrow());
        assert_eq!(selection.begin(true), Err(SelectionError::AlreadySubmitting));

        selection.finish(&Err::<(), _>("add failed"));
        assert!(!selection.is_submitting());
        assert!(selection.is_open());

        selection.begin(true).unwrap();
        selection.finish(&Ok::<(), ()>(()));
        assert!(!selection.is_submitting());
        assert!(!selection.is_open());
    }

    #[tokio::test]
    async fn test_submitting_visible_while_in_flight_and_cleared_on_drop() {
        use std::sync::Arc;

        use urban_threads_core::UserId;

        use crate::cart::CartSettings;
        use crate::gateway::memory::InMemoryBackend;
        use crate::session::{CurrentUser, SessionContext};

        let backend = Arc::new(InMemoryBackend::new());
        backend.seed(
            "products",
            [json!({"id": "p-1", "name": "Oversized Tee", "price": 59_000,
                    "sizes": [], "colors": [], "stock_quantity": 5})],
        );
        let user = UserId::new("u-1");
        backend.sign_in_as(&user);
        let session = SessionContext::signed_in(CurrentUser {
            id: user,
            email: None,
        });
        let cart = CartController::new(Arc::clone(&backend), session, CartSettings::default());
        // The add goes through; the refetch after it parks.
        backend.hold_queries(true);

        let mut selection = ProductSelection::open(product(&[], &[], Some(5)));
        let mut submitting = selection.watch_submitting();
        {
            let submit = selection.submit(&cart);
            tokio::pin!(submit);
            tokio::select! {
                _ = &mut submit => panic!("add finished while its refetch is parked"),
                () = backend.wait_for_held_queries(1) => {}
            }
            assert!(*submitting.borrow_and_update());
        }

        assert!(!selection.is_submitting());
        assert!(!*submitting.borrow());
        assert!(selection.is_open());
        assert!(selection.begin(true).is_ok());
        backend.release_all();
    }

    #[test]
    fn test_out_of_stock_refused() {
        let selection = ProductSelection::open(product(&[], &[], Some(0)));
        assert_eq!(selection.validate(true), Err(SelectionError::OutOfStock));
    }
}
