//! Cart consistency controller.
//!
//! [`CartController`] owns the displayed cart for the signed-in shopper. It
//! never merges local guesses into the line set: every add, quantity change
//! or removal is sent to the backend, the cart's cache entry is invalidated,
//! and the lines are fetched again. Change notifications from the realtime
//! channel take the same invalidate-and-refetch path, so edits made on
//! another device converge within one round trip.
//!
//! # Phases
//!
//! ```text
//! Idle ──refresh / push / stale──▶ Fetching ──ok──▶ Idle
//!                                     └──err──▶ Error ──retry──▶ Fetching
//! Idle ──add/update/remove──▶ Mutating ──ok──▶ Fetching
//!                                 └──err──▶ Error
//! ```
//!
//! A failed fetch or mutation keeps the previously displayed lines and sets
//! an error message. An expired session discards everything.
//!
//! Each fetch takes a generation number; a response is only applied if no
//! newer fetch has started since, so an old response can never overwrite a
//! newer one.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use urban_threads_core::{BaseAmount, CartLineId, UserId};

use crate::cache::{CachePolicy, QueryCache, keys};
use crate::config::StorefrontConfig;
use crate::error::{Result, StorefrontError, add_breadcrumb, report};
use crate::gateway::{
    ChannelScope, Embed, Filter, Gateway, GatewayError, Mutation, RowQuery, SortOrder, decode_rows,
};
use crate::models::{CartLine, CartTotals, Product, ProductSnapshot};
use crate::retry::RetryPolicy;
use crate::selection::{LineRequest, SelectionError};
use crate::session::{SessionContext, SessionStatus};

const CART_TABLE: &str = "cart_items";

/// What the controller is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CartPhase {
    #[default]
    Idle,
    Fetching,
    Mutating,
    Error,
}

/// The cart as currently displayed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CartSnapshot {
    /// Newest first.
    pub lines: Vec<CartLine>,
    pub phase: CartPhase,
    /// Message for the last failure. Lines from before it are kept.
    pub error: Option<String>,
    /// The current fetch has been pending longer than the slow threshold.
    pub slow: bool,
    /// A fetch has succeeded since the last sign-in.
    pub loaded: bool,
}

impl CartSnapshot {
    /// Totals computed from the lines in this snapshot.
    #[must_use]
    pub fn totals(&self, shipping: BaseAmount) -> CartTotals {
        CartTotals::compute(&self.lines, shipping)
    }

    #[must_use]
    pub fn line(&self, id: &CartLineId) -> Option<&CartLine> {
        self.lines.iter().find(|line| &line.id == id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Tuning for [`CartController`].
#[derive(Debug, Clone)]
pub struct CartSettings {
    pub cache: CachePolicy,
    pub slow_after: Duration,
    pub shipping_fee: BaseAmount,
    /// Backoff between realtime resubscription attempts.
    pub resubscribe: RetryPolicy,
}

impl Default for CartSettings {
    fn default() -> Self {
        Self {
            cache: CachePolicy::cart(),
            slow_after: Duration::from_secs(10),
            shipping_fee: BaseAmount::new(5_000),
            resubscribe: RetryPolicy::default(),
        }
    }
}

impl CartSettings {
    #[must_use]
    pub fn from_config(config: &StorefrontConfig) -> Self {
        Self {
            cache: config.cart_cache,
            slow_after: config.fetch_slow_after,
            shipping_fee: config.shipping_fee,
            resubscribe: RetryPolicy::default(),
        }
    }
}

/// Single source of truth for the shopper's cart. Cheaply cloneable.
pub struct CartController<G> {
    inner: Arc<Inner<G>>,
}

impl<G> Clone for CartController<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<G> {
    gateway: Arc<G>,
    session: SessionContext,
    cache: QueryCache<Vec<CartLine>>,
    settings: CartSettings,
    state: watch::Sender<CartSnapshot>,
    generation: AtomicU64,
}

impl<G: Gateway> CartController<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, session: SessionContext, settings: CartSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                session,
                cache: QueryCache::new(),
                settings,
                state: watch::Sender::new(CartSnapshot::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    #[must_use]
    pub fn snapshot(&self) -> CartSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Watch the displayed cart.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CartSnapshot> {
        self.inner.state.subscribe()
    }

    /// Totals for the displayed lines, recomputed on every call.
    #[must_use]
    pub fn totals(&self) -> CartTotals {
        self.inner
            .state
            .borrow()
            .totals(self.inner.settings.shipping_fee)
    }

    #[must_use]
    pub fn shipping_fee(&self) -> BaseAmount {
        self.inner.settings.shipping_fee
    }

    /// Bring the displayed cart up to date.
    ///
    /// Served from the cache when fresh. A stale entry is displayed while it
    /// is refetched. Signed out, the cart is emptied.
    ///
    /// # Errors
    ///
    /// - [`StorefrontError::StaleResponse`] if a newer fetch started first
    /// - [`StorefrontError::AuthExpired`] if the backend rejected the session
    /// - [`StorefrontError::Gateway`] if the fetch failed; previous lines stay
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<CartSnapshot> {
        let Some(user) = self.inner.session.user_id() else {
            self.clear().await;
            return Ok(self.snapshot());
        };
        let generation = self.next_generation();
        let key = keys::cart(&user);

        let stale = match self.inner.cache.get(&key).await {
            Some(hit) if !hit.stale => return self.apply(generation, &user, Ok(hit.value)).await,
            Some(hit) => Some(hit.value),
            None => None,
        };
        self.update(generation, |snapshot| {
            if let Some(lines) = stale {
                snapshot.lines = lines;
            }
            snapshot.phase = CartPhase::Fetching;
            snapshot.slow = false;
        });

        let fetch = self
            .inner
            .cache
            .fetch(&key, self.inner.settings.cache, self.fetch_lines(&user));
        tokio::pin!(fetch);
        let result = tokio::select! {
            result = &mut fetch => result,
            () = tokio::time::sleep(self.inner.settings.slow_after) => {
                self.mark_slow(generation);
                fetch.await
            }
        };
        self.apply(generation, &user, result).await
    }

    /// Refetch from the backend, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Same as [`CartController::refresh`].
    pub async fn retry(&self) -> Result<CartSnapshot> {
        if let Some(user) = self.inner.session.user_id() {
            self.inner.cache.invalidate(&keys::cart(&user)).await;
        }
        self.refresh().await
    }

    /// Add `request` of `product` through the `add_to_cart` procedure, which
    /// merges with an identical line and enforces stock.
    ///
    /// # Errors
    ///
    /// Returns a validation error without calling the backend when signed
    /// out or when the request does not fit the product's options; otherwise
    /// the procedure's error.
    #[instrument(skip(self, product, request), fields(product_id = %product.id, quantity = request.quantity))]
    pub async fn add_line(&self, product: &Product, request: &LineRequest) -> Result<()> {
        let user = self.require_user()?;
        request.check(product)?;

        let args = json!({
            "p_product_id": product.id.as_str(),
            "p_quantity": request.quantity,
            "p_size": request.size,
            "p_color": request.color,
        });
        let gateway = &self.inner.gateway;
        self.mutate(
            &user,
            "Added to cart",
            &[("product_id", product.id.as_str())],
            async move { gateway.call_procedure("add_to_cart", args).await.map(drop) },
        )
        .await
    }

    /// Set a line's quantity. Zero or less removes the line.
    ///
    /// Quantities above the line's known stock are clamped to it.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::OutOfStock`] (as a validation error) when
    /// the product has no stock left, or the backend's error.
    #[instrument(skip(self, line_id), fields(line_id = %line_id))]
    pub async fn update_quantity(&self, line_id: &CartLineId, quantity: i64) -> Result<()> {
        if quantity <= 0 {
            return self.remove_line(line_id).await;
        }
        let user = self.require_user()?;

        let requested = u32::try_from(quantity).unwrap_or(u32::MAX);
        let quantity = self
            .snapshot()
            .line(line_id)
            .map_or(requested, |line| line.clamp_quantity(requested));
        if quantity == 0 {
            return Err(SelectionError::OutOfStock.into());
        }

        let mutation = Mutation::update(CART_TABLE, json!({ "quantity": quantity }))
            .filter(Filter::eq("id", line_id.as_str()))
            .filter(Filter::eq("user_id", user.as_str()));
        let gateway = &self.inner.gateway;
        self.mutate(
            &user,
            "Changed cart quantity",
            &[("line_id", line_id.as_str())],
            async move { gateway.mutate(&mutation).await.map(drop) },
        )
        .await
    }

    /// Delete a line.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the line stays displayed.
    #[instrument(skip(self, line_id), fields(line_id = %line_id))]
    pub async fn remove_line(&self, line_id: &CartLineId) -> Result<()> {
        let user = self.require_user()?;
        let mutation = Mutation::delete(CART_TABLE)
            .filter(Filter::eq("id", line_id.as_str()))
            .filter(Filter::eq("user_id", user.as_str()));
        let gateway = &self.inner.gateway;
        self.mutate(
            &user,
            "Removed from cart",
            &[("line_id", line_id.as_str())],
            async move { gateway.mutate(&mutation).await.map(drop) },
        )
        .await
    }

    /// Forget the shopper's cart after an out-of-band change such as order
    /// placement, then refetch.
    pub async fn invalidate(&self) {
        if let Some(user) = self.inner.session.user_id() {
            self.resync(&user).await;
        }
    }

    /// Drop all cart state. Any fetch still in flight is discarded.
    pub async fn clear(&self) {
        self.next_generation();
        self.inner.state.send_replace(CartSnapshot::default());
        self.inner.cache.clear().await;
    }

    /// Follow the realtime channel for the signed-in shopper's cart rows.
    ///
    /// Every change, whatever its origin, invalidates and refetches. The
    /// channel follows sign-in and sign-out, and a dropped channel is
    /// resubscribed with backoff. Stops when the returned handle drops.
    #[must_use]
    pub fn watch_realtime(&self) -> RealtimeWatch {
        let controller = self.clone();
        RealtimeWatch {
            task: tokio::spawn(async move { controller.follow_session().await }),
        }
    }

    async fn follow_session(self) {
        let mut session = self.inner.session.subscribe();
        loop {
            let status = session.borrow_and_update().clone();
            let alive = match status {
                SessionStatus::SignedIn(user) => self.follow_user(&user.id, &mut session).await,
                SessionStatus::SignedOut | SessionStatus::Expired => session.changed().await.is_ok(),
            };
            if !alive {
                return;
            }
        }
    }

    /// Keep a channel open for `user` until the session moves to someone
    /// else. Returns `false` once the session itself is gone.
    async fn follow_user(
        &self,
        user: &UserId,
        session: &mut watch::Receiver<SessionStatus>,
    ) -> bool {
        let scope = ChannelScope::table(CART_TABLE).where_eq("user_id", user.as_str());
        let retry = &self.inner.settings.resubscribe;
        let stale_after = self.inner.settings.cache.stale_after;
        let mut attempt = 0_u32;

        loop {
            match self.inner.gateway.subscribe(&scope).await {
                Ok(mut subscription) => {
                    debug!(user_id = %user, "Cart channel subscribed");
                    attempt = 0;
                    // Anything that happened while unsubscribed was missed.
                    self.resync(user).await;
                    loop {
                        tokio::select! {
                            event = subscription.next() => {
                                let Some(event) = event else {
                                    warn!(user_id = %user, "Cart channel dropped, resubscribing");
                                    break;
                                };
                                debug!(table = %event.table, kind = ?event.kind, "Cart change received");
                                self.resync(user).await;
                            }
                            // A missed change is picked up once the lines go stale.
                            () = tokio::time::sleep(stale_after) => {
                                debug!(user_id = %user, "Cart stale, refetching");
                                self.resync(user).await;
                            }
                            changed = session.changed() => {
                                if changed.is_err() {
                                    return false;
                                }
                                if !signed_in_as(session, user) {
                                    return true;
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_auth_expired() => {
                    let _ = self.fail(e.into()).await;
                    return wait_for_session_change(session, user).await;
                }
                Err(e) => warn!(error = %e, attempt, "Cart channel subscribe failed"),
            }

            attempt += 1;
            if !retry.allows(attempt) {
                warn!(attempt, "Giving up on cart channel until the session changes");
                return wait_for_session_change(session, user).await;
            }
            tokio::select! {
                () = tokio::time::sleep(retry.delay(attempt)) => {}
                changed = session.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if !signed_in_as(session, user) {
                        return true;
                    }
                }
            }
        }
    }

    async fn resync(&self, user: &UserId) {
        self.inner.cache.invalidate(&keys::cart(user)).await;
        match self.refresh().await {
            Ok(_) | Err(StorefrontError::StaleResponse) => {}
            Err(e) => debug!(error = %e, "Cart refetch failed"),
        }
    }

    async fn mutate(
        &self,
        user: &UserId,
        action: &str,
        breadcrumb: &[(&str, &str)],
        op: impl Future<Output = std::result::Result<(), GatewayError>>,
    ) -> Result<()> {
        self.inner
            .state
            .send_modify(|snapshot| snapshot.phase = CartPhase::Mutating);

        if let Err(e) = op.await {
            return Err(self.fail(e.into()).await);
        }

        add_breadcrumb("cart", action, breadcrumb);
        info!(user_id = %user, action, "Cart changed");
        self.inner.cache.invalidate(&keys::cart(user)).await;
        // The change is committed; a failed refetch only shows in the snapshot.
        if let Err(StorefrontError::AuthExpired) = self.refresh().await {
            return Err(StorefrontError::AuthExpired);
        }
        Ok(())
    }

    async fn apply(
        &self,
        generation: u64,
        user: &UserId,
        result: std::result::Result<Vec<CartLine>, GatewayError>,
    ) -> Result<CartSnapshot> {
        if !self.is_current(generation) || self.inner.session.user_id().as_ref() != Some(user) {
            debug!(generation, "Discarding superseded cart response");
            return Err(StorefrontError::StaleResponse);
        }
        match result {
            Ok(lines) => {
                self.update(generation, |snapshot| {
                    snapshot.lines = lines;
                    snapshot.phase = CartPhase::Idle;
                    snapshot.error = None;
                    snapshot.slow = false;
                    snapshot.loaded = true;
                });
                Ok(self.snapshot())
            }
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    /// Surface a failure. Lines stay, unless the session expired.
    async fn fail(&self, err: StorefrontError) -> StorefrontError {
        if matches!(err, StorefrontError::AuthExpired) {
            warn!("Session rejected, discarding cart");
            self.inner.session.expire();
            self.clear().await;
        } else {
            let message = err.user_message();
            self.inner.state.send_modify(|snapshot| {
                snapshot.phase = CartPhase::Error;
                snapshot.error = Some(message);
                snapshot.slow = false;
            });
        }
        report(&err);
        err
    }

    fn mark_slow(&self, generation: u64) {
        let slow_after = self.inner.settings.slow_after;
        self.update(generation, |snapshot| snapshot.slow = true);
        warn!(error = %StorefrontError::Timeout(slow_after), "Cart fetch is slow");
    }

    fn fetch_lines(
        &self,
        user: &UserId,
    ) -> impl FnOnce() -> BoxFuture<'static, std::result::Result<Vec<CartLine>, GatewayError>> + Send
    {
        let gateway = Arc::clone(&self.inner.gateway);
        let query = cart_query(user);
        move || async move { decode_rows(gateway.query(&query).await?) }.boxed()
    }

    fn require_user(&self) -> Result<UserId> {
        self.inner
            .session
            .user_id()
            .ok_or_else(|| SelectionError::NotSignedIn.into())
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply `change` only if `generation` is still the newest fetch.
    fn update(&self, generation: u64, change: impl FnOnce(&mut CartSnapshot)) {
        self.inner.state.send_if_modified(|snapshot| {
            if !self.is_current(generation) {
                return false;
            }
            change(snapshot);
            true
        });
    }
}

fn cart_query(user: &UserId) -> RowQuery {
    RowQuery::table(CART_TABLE)
        .columns(CartLine::COLUMNS)
        .embed(Embed::inner("products", "product_id", ProductSnapshot::COLUMNS))
        .filter(Filter::eq("user_id", user.as_str()))
        .order(SortOrder::desc("created_at"))
}

fn signed_in_as(session: &watch::Receiver<SessionStatus>, user: &UserId) -> bool {
    matches!(&*session.borrow(), SessionStatus::SignedIn(current) if &current.id == user)
}

async fn wait_for_session_change(
    session: &mut watch::Receiver<SessionStatus>,
    user: &UserId,
) -> bool {
    loop {
        if session.changed().await.is_err() {
            return false;
        }
        if !signed_in_as(session, user) {
            return true;
        }
    }
}

/// Handle to the realtime follower started by
/// [`CartController::watch_realtime`]. Dropping it stops the follower.
#[derive(Debug)]
pub struct RealtimeWatch {
    task: JoinHandle<()>,
}

impl RealtimeWatch {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::gateway::memory::InMemoryBackend;
    use crate::session::CurrentUser;

    fn tee() -> Value {
        json!({
            "id": "p-tee",
            "name": "Boxy Tee",
            "price": 45_000,
            "image_url": null,
            "stock_quantity": 5,
            "sizes": ["S", "M"],
            "colors": [],
        })
    }

    fn setup() -> (Arc<InMemoryBackend>, CartController<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed("products", [tee()]);
        let user = UserId::new("u-1");
        backend.sign_in_as(&user);
        let session = SessionContext::signed_in(CurrentUser {
            id: user,
            email: None,
        });
        let cart = CartController::new(Arc::clone(&backend), session, CartSettings::default());
        (backend, cart)
    }

    fn product() -> Product {
        serde_json::from_value(tee()).unwrap()
    }

    fn request(quantity: u32, size: &str) -> LineRequest {
        LineRequest {
            quantity,
            size: Some(size.to_owned()),
            color: None,
        }
    }

    #[tokio::test]
    async fn test_add_then_read_shows_line() {
        let (_backend, cart) = setup();
        cart.add_line(&product(), &request(2, "M")).await.unwrap();

        let snapshot = cart.snapshot();
        assert_eq!(snapshot.phase, CartPhase::Idle);
        assert_eq!(snapshot.lines.len(), 1);
        assert_eq!(snapshot.lines[0].quantity, 2);
        assert_eq!(snapshot.lines[0].selected_size.as_deref(), Some("M"));
        assert_eq!(cart.totals().subtotal, BaseAmount::new(90_000));
        assert_eq!(cart.totals().total, BaseAmount::new(95_000));
    }

    #[tokio::test]
    async fn test_quantity_zero_deletes_line() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        cart.update_quantity(&line_id, 0).await.unwrap();
        assert!(cart.snapshot().is_empty());
        assert!(backend.rows("cart_items").is_empty());
    }

    #[tokio::test]
    async fn test_quantity_clamped_to_stock() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        cart.update_quantity(&line_id, 40).await.unwrap();
        assert_eq!(cart.snapshot().lines[0].quantity, 5);
        assert_eq!(backend.rows("cart_items")[0]["quantity"], 5);
    }

    fn quantities(backend: &InMemoryBackend) -> Vec<i64> {
        backend
            .rows("cart_items")
            .iter()
            .map(|row| row["quantity"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_negative_quantity_deletes_line() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(2, "M")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        cart.update_quantity(&line_id, -3).await.unwrap();
        assert!(cart.snapshot().is_empty());
        assert!(backend.rows("cart_items").is_empty());
    }

    #[tokio::test]
    async fn test_lower_quantity_updates_in_place() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(3, "M")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        cart.update_quantity(&line_id, 2).await.unwrap();
        let snapshot = cart.snapshot();
        assert_eq!(snapshot.lines.len(), 1);
        assert_eq!(snapshot.lines[0].id, line_id);
        assert_eq!(snapshot.lines[0].quantity, 2);
        assert_eq!(quantities(&backend), [2]);
    }

    #[tokio::test]
    async fn test_quantity_sequence_never_persists_zero() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(2, "M")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();
        assert_eq!(quantities(&backend), [2]);

        cart.update_quantity(&line_id, 5).await.unwrap();
        assert_eq!(quantities(&backend), [5]);
        assert_eq!(cart.snapshot().lines[0].quantity, 5);

        cart.update_quantity(&line_id, 0).await.unwrap();
        assert!(quantities(&backend).is_empty());
        assert!(cart.snapshot().is_empty());

        cart.add_line(&product(), &request(1, "M")).await.unwrap();
        assert_eq!(quantities(&backend), [1]);
        let snapshot = cart.snapshot();
        assert_eq!(snapshot.lines.len(), 1);
        assert_ne!(snapshot.lines[0].id, line_id);
        assert_eq!(snapshot.lines[0].quantity, 1);
    }

    #[tokio::test]
    async fn test_sold_out_line_cannot_be_raised() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        backend
            .apply_external(
                &Mutation::update("products", json!({ "stock_quantity": 0 }))
                    .filter(Filter::eq("id", "p-tee")),
            )
            .unwrap();
        cart.retry().await.unwrap();
        let mutations = backend.mutation_count();

        let err = cart.update_quantity(&line_id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            StorefrontError::Validation(message) if message == SelectionError::OutOfStock.to_string()
        ));
        assert_eq!(backend.mutation_count(), mutations);
        assert_eq!(quantities(&backend), [1]);
    }

    #[tokio::test]
    async fn test_signed_out_add_never_reaches_backend() {
        let (backend, cart) = setup();
        cart.session().sign_out();

        let err = cart.add_line(&product(), &request(1, "S")).await.unwrap_err();
        assert!(matches!(err, StorefrontError::Validation(_)));
        assert_eq!(backend.procedure_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_lines() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();

        backend.fail_next_query(GatewayError::Transport("connection reset".to_owned()));
        let err = cart.retry().await.unwrap_err();
        assert!(matches!(err, StorefrontError::Gateway(_)));

        let snapshot = cart.snapshot();
        assert_eq!(snapshot.phase, CartPhase::Error);
        assert!(snapshot.error.is_some());
        assert_eq!(snapshot.lines.len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_failure_keeps_lines() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();
        let line_id = cart.snapshot().lines[0].id.clone();

        backend.fail_next_mutation(GatewayError::Status {
            status: 503,
            message: "unavailable".to_owned(),
        });
        assert!(cart.remove_line(&line_id).await.is_err());
        assert_eq!(cart.snapshot().lines.len(), 1);
        assert_eq!(backend.rows("cart_items").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_discards_cart() {
        let (backend, cart) = setup();
        cart.add_line(&product(), &request(1, "S")).await.unwrap();

        backend.fail_next_query(GatewayError::Unauthorized("JWT expired".to_owned()));
        let err = cart.retry().await.unwrap_err();
        assert!(matches!(err, StorefrontError::AuthExpired));
        assert!(cart.snapshot().is_empty());
        assert_eq!(cart.session().status(), SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_query() {
        let (backend, cart) = setup();
        cart.refresh().await.unwrap();
        let queries = backend.query_count();

        cart.refresh().await.unwrap();
        assert_eq!(backend.query_count(), queries);
    }
}
