//! Unified error handling with Sentry integration.
//!
//! Every storefront operation returns [`Result<T>`]. Gateway failures are
//! classified once, here: an expired session becomes
//! [`StorefrontError::AuthExpired`], everything else stays a
//! [`StorefrontError::Gateway`]. Callers show [`StorefrontError::user_message`]
//! and hand the error to [`report`], which decides what reaches Sentry.

use std::time::Duration;

use thiserror::Error;
use urban_threads_core::ContactError;

use crate::checkout::CheckoutError;
use crate::currency::PreferenceError;
use crate::gateway::GatewayError;
use crate::selection::SelectionError;

/// Storefront-level error type.
#[derive(Debug, Error)]
pub enum StorefrontError {
    /// A client-side precondition failed; nothing was sent to the backend.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A backend call failed.
    #[error("Backend error: {0}")]
    Gateway(#[source] GatewayError),

    /// A newer request for the same data finished first.
    #[error("Response superseded by a newer request")]
    StaleResponse,

    /// The session is no longer valid; cart state has been discarded.
    #[error("Session expired")]
    AuthExpired,

    /// A fetch has been pending longer than the slow threshold.
    #[error("Request still pending after {0:?}")]
    Timeout(Duration),

    /// Checkout could not be completed.
    #[error("Checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    /// The display-currency preference could not be saved.
    #[error("Preference error: {0}")]
    Preference(#[from] PreferenceError),

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for StorefrontError {
    fn from(err: GatewayError) -> Self {
        if err.is_auth_expired() {
            Self::AuthExpired
        } else {
            Self::Gateway(err)
        }
    }
}

impl From<SelectionError> for StorefrontError {
    fn from(err: SelectionError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ContactError> for StorefrontError {
    fn from(err: ContactError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl StorefrontError {
    /// Text safe to show to the shopper.
    ///
    /// Backend internals are never included, except stored-procedure
    /// rejections, which are written for the shopper ("insufficient stock").
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Gateway(GatewayError::Procedure { message, .. }) => message.clone(),
            Self::Gateway(GatewayError::RateLimited(_)) => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            Self::Gateway(GatewayError::NotFound(_)) => {
                "We couldn't find what you were looking for.".to_string()
            }
            Self::Gateway(GatewayError::Transport(_) | GatewayError::Channel(_)) => {
                "Can't reach the store right now. Check your connection and try again.".to_string()
            }
            Self::Gateway(_) | Self::Internal(_) => {
                "Something went wrong. Please try again.".to_string()
            }
            Self::StaleResponse => String::new(),
            Self::AuthExpired => "Your session has expired. Please sign in again.".to_string(),
            Self::Timeout(_) => "This is taking longer than usual. You can retry.".to_string(),
            Self::Checkout(err) => err.to_string(),
            Self::Preference(_) => "Your currency choice could not be saved.".to_string(),
        }
    }

    /// Whether the error should be captured to Sentry.
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        matches!(
            self,
            Self::Gateway(
                GatewayError::Transport(_)
                    | GatewayError::Status { .. }
                    | GatewayError::Decode(_)
                    | GatewayError::Channel(_)
            ) | Self::Internal(_)
        )
    }

    /// Whether the error should be shown at all.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::StaleResponse)
    }
}

/// Result type alias for `StorefrontError`.
pub type Result<T> = std::result::Result<T, StorefrontError>;

/// Log an error surfaced to the shopper, capturing it to Sentry when it
/// points at a backend or internal fault.
pub fn report(err: &StorefrontError) {
    if err.is_reportable() {
        let event_id = sentry::capture_error(err);
        tracing::error!(
            error = %err,
            sentry_event_id = %event_id,
            "Storefront error"
        );
    } else if !err.is_silent() {
        tracing::debug!(error = %err, "Storefront error shown to user");
    }
}

/// Associate subsequent Sentry events with the signed-in shopper.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context on sign-out.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Record a shopper action in the trail attached to later error reports.
///
/// ```rust,ignore
/// add_breadcrumb("cart", "Added to cart", &[("product_id", "p-1")]);
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: &[(&str, &str)]) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    for (key, value) in data {
        breadcrumb.data.insert(
            (*key).to_string(),
            serde_json::Value::String((*value).to_string()),
        );
    }

    sentry::add_breadcrumb(breadcrumb);
}
