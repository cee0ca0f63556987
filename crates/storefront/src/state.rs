//! The storefront as one handle: session, cart, catalog, account, checkout
//! and the display currency, all wired to the same gateway.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, instrument, warn};

use crate::account::Account;
use crate::cart::{CartController, CartSettings};
use crate::catalog::Catalog;
use crate::checkout::Checkout;
use crate::config::StorefrontConfig;
use crate::currency::CurrencyPreference;
use crate::error::{Result, StorefrontError};
use crate::gateway::{Gateway, SupabaseClient};
use crate::session::{CurrentUser, SessionContext};

/// Application state shared by every caller.
///
/// Cheaply cloneable via `Arc`.
pub struct Storefront<G> {
    inner: Arc<StorefrontInner<G>>,
}

struct StorefrontInner<G> {
    gateway: Arc<G>,
    session: SessionContext,
    cart: CartController<G>,
    catalog: Catalog<G>,
    account: Account<G>,
    checkout: Checkout<G>,
    currency: CurrencyPreference,
}

impl<G> Clone for Storefront<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Gateway> Storefront<G> {
    /// Wire every service to `gateway`.
    pub async fn with_gateway(gateway: Arc<G>, config: &StorefrontConfig) -> Self {
        let currency = CurrencyPreference::load(config.preferences_path.clone()).await;
        Self::assemble(gateway, CartSettings::from_config(config), config, currency)
    }

    /// Wire every service to `gateway`, with explicit cart settings and a
    /// preference already loaded.
    pub fn assemble(
        gateway: Arc<G>,
        cart_settings: CartSettings,
        config: &StorefrontConfig,
        currency: CurrencyPreference,
    ) -> Self {
        let session = SessionContext::new();
        let cart = CartController::new(Arc::clone(&gateway), session.clone(), cart_settings);
        let catalog = Catalog::new(Arc::clone(&gateway), config.catalog_cache);
        let account = Account::new(Arc::clone(&gateway), session.clone());
        let checkout = Checkout::new(Arc::clone(&gateway), cart.clone(), account.clone());

        Self {
            inner: Arc::new(StorefrontInner {
                gateway,
                session,
                cart,
                catalog,
                account,
                checkout,
                currency,
            }),
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<G> {
        &self.inner.gateway
    }

    #[must_use]
    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    #[must_use]
    pub fn cart(&self) -> &CartController<G> {
        &self.inner.cart
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog<G> {
        &self.inner.catalog
    }

    #[must_use]
    pub fn account(&self) -> &Account<G> {
        &self.inner.account
    }

    #[must_use]
    pub fn checkout(&self) -> &Checkout<G> {
        &self.inner.checkout
    }

    #[must_use]
    pub fn currency(&self) -> &CurrencyPreference {
        &self.inner.currency
    }
}

impl Storefront<SupabaseClient> {
    /// Connect to the hosted backend described by `config`.
    pub async fn connect(config: &StorefrontConfig) -> Self {
        let client = Arc::new(SupabaseClient::new(&config.supabase));
        Self::with_gateway(client, config).await
    }

    /// Sign in and load the shopper's cart.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error if the credentials are rejected. A cart
    /// that fails to load afterwards is reported through the cart snapshot,
    /// not here.
    #[instrument(skip(self, password))]
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<CurrentUser> {
        let tokens = self
            .inner
            .gateway
            .sign_in_with_password(email, password)
            .await?;
        let user = CurrentUser {
            id: tokens.user_id.clone(),
            email: tokens.email.clone(),
        };
        self.inner.session.sign_in(user.clone());
        if let Err(e) = self.inner.cart.refresh().await {
            warn!(error = %e, "Cart not loaded after sign-in");
        }
        Ok(user)
    }

    /// Exchange the refresh token when the access token is within `margin`
    /// of expiry. Returns whether a refresh happened.
    ///
    /// # Errors
    ///
    /// Returns [`StorefrontError::AuthExpired`] if the backend no longer
    /// accepts the refresh token; the session is expired and the cart
    /// discarded.
    #[instrument(skip(self))]
    pub async fn refresh_session(&self, margin: chrono::Duration) -> Result<bool> {
        let Some(tokens) = self.inner.gateway.session() else {
            return Ok(false);
        };
        if !tokens.expires_within(margin) {
            return Ok(false);
        }
        match self.inner.gateway.refresh_session(&tokens).await {
            Ok(_) => {
                debug!(user_id = %tokens.user_id, "Session refreshed");
                Ok(true)
            }
            Err(e) => {
                let err = StorefrontError::from(e);
                if matches!(err, StorefrontError::AuthExpired) {
                    self.inner.gateway.set_session(None);
                    self.inner.session.expire();
                    self.inner.cart.clear().await;
                }
                Err(err)
            }
        }
    }

    /// Sign out locally and revoke the session on the backend.
    pub async fn sign_out(&self) {
        self.inner.cart.clear().await;
        if let Err(e) = self.inner.gateway.sign_out().await {
            warn!(error = %e, "Backend sign-out failed, local session cleared");
        }
        self.inner.session.sign_out();
    }
}
