//! Cart convergence with the backend.
//!
//! The cart is server-authoritative: every change is written to the backend
//! and then refetched, and changes made elsewhere arrive over the realtime
//! channel.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::time::Duration;

use serde_json::json;
use urban_threads_core::{BaseAmount, ProductId};
use urban_threads_integration_tests::{TestContext, eventually};
use urban_threads_storefront::StorefrontError;
use urban_threads_storefront::cart::CartPhase;
use urban_threads_storefront::gateway::{Filter, GatewayError, Mutation};
use urban_threads_storefront::selection::ProductSelection;
use urban_threads_storefront::session::SessionStatus;

async fn add_tee(ctx: &TestContext, size: &str, quantity: u32) {
    let product = ctx
        .store
        .catalog()
        .product(&ProductId::new("p-tee"))
        .await
        .unwrap();
    let mut selection = ProductSelection::open(product);
    selection.choose_size(Some(size)).unwrap();
    selection.set_quantity(quantity);
    selection.submit(ctx.store.cart()).await.unwrap();
    assert!(!selection.is_open());
}

#[tokio::test]
async fn test_added_line_matches_backend() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "M", 2).await;

    let snapshot = ctx.store.cart().snapshot();
    assert_eq!(snapshot.phase, CartPhase::Idle);
    assert_eq!(snapshot.lines.len(), 1);
    let line = &snapshot.lines[0];
    assert_eq!(line.quantity, 2);
    assert_eq!(line.selected_size.as_deref(), Some("M"));
    assert_eq!(line.selected_color.as_deref(), Some("Black"));
    assert_eq!(line.product.name, "Boxy Tee");

    let rows = ctx.cart_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["quantity"], 2);
}

#[tokio::test]
async fn test_same_options_merge_into_one_line() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "M", 2).await;
    add_tee(&ctx, "M", 1).await;
    add_tee(&ctx, "L", 1).await;

    let snapshot = ctx.store.cart().snapshot();
    assert_eq!(snapshot.lines.len(), 2);
    let medium = snapshot
        .lines
        .iter()
        .find(|line| line.selected_size.as_deref() == Some("M"))
        .unwrap();
    assert_eq!(medium.quantity, 3);

    let totals = ctx.store.cart().totals();
    assert_eq!(totals.item_count, 4);
    assert_eq!(totals.subtotal, BaseAmount::new(180_000));
    assert_eq!(totals.shipping, BaseAmount::new(5_000));
    assert_eq!(totals.total, BaseAmount::new(185_000));
}

#[tokio::test]
async fn test_quantity_zero_removes_line() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "S", 1).await;
    let line_id = ctx.store.cart().snapshot().lines[0].id.clone();

    ctx.store.cart().update_quantity(&line_id, 0).await.unwrap();
    assert!(ctx.store.cart().snapshot().is_empty());
    assert!(ctx.cart_rows().is_empty());
}

#[tokio::test]
async fn test_insufficient_stock_is_rejected_by_backend() {
    let ctx = TestContext::signed_in().await;
    let shirt = ctx
        .store
        .catalog()
        .product(&ProductId::new("p-shirt"))
        .await
        .unwrap();
    let mut selection = ProductSelection::open(shirt);
    selection.set_quantity(3);
    selection.submit(ctx.store.cart()).await.unwrap();

    let mut again = ProductSelection::open(selection.product().clone());
    let err = again.submit(ctx.store.cart()).await.unwrap_err();
    assert!(matches!(err, StorefrontError::Gateway(_)));
    assert!(again.is_open());

    let snapshot = ctx.store.cart().snapshot();
    assert_eq!(snapshot.phase, CartPhase::Error);
    assert_eq!(snapshot.lines[0].quantity, 3);
}

#[tokio::test]
async fn test_external_change_arrives_over_realtime() {
    let ctx = TestContext::signed_in().await;
    let cart = ctx.store.cart();
    let _watch = cart.watch_realtime();
    eventually("cart channel", || async { ctx.backend.subscribe_count() >= 1 }).await;

    ctx.backend
        .apply_external(&Mutation::insert(
            "cart_items",
            json!({
                "user_id": ctx.user.as_str(),
                "product_id": "p-shirt",
                "quantity": 1,
                "selected_size": "L",
                "selected_color": null,
            }),
        ))
        .unwrap();
    eventually("line from another device", || async {
        cart.snapshot().lines.len() == 1
    })
    .await;

    ctx.backend.drop_subscriptions();
    eventually("resubscription", || async { ctx.backend.subscribe_count() >= 2 }).await;

    ctx.backend
        .apply_external(
            &Mutation::update("cart_items", json!({ "quantity": 2 }))
                .filter(Filter::eq("user_id", ctx.user.as_str())),
        )
        .unwrap();
    eventually("quantity change after resubscribe", || async {
        cart.snapshot().lines.first().is_some_and(|line| line.quantity == 2)
    })
    .await;
}

#[tokio::test]
async fn test_other_shoppers_changes_are_ignored() {
    let ctx = TestContext::signed_in().await;
    let cart = ctx.store.cart();
    let _watch = cart.watch_realtime();
    eventually("initial load", || async { cart.snapshot().loaded }).await;
    let queries = ctx.backend.query_count();

    ctx.backend
        .apply_external(&Mutation::insert(
            "cart_items",
            json!({
                "user_id": "someone-else",
                "product_id": "p-tee",
                "quantity": 1,
                "selected_size": "S",
                "selected_color": "White",
            }),
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ctx.backend.query_count(), queries);
    assert!(cart.snapshot().is_empty());
}

#[tokio::test]
async fn test_fetch_failure_keeps_previous_lines() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "M", 1).await;

    ctx.backend
        .fail_next_query(GatewayError::Transport("connection reset".to_owned()));
    assert!(ctx.store.cart().retry().await.is_err());

    let snapshot = ctx.store.cart().snapshot();
    assert_eq!(snapshot.phase, CartPhase::Error);
    assert!(snapshot.error.is_some());
    assert_eq!(snapshot.lines.len(), 1);

    let recovered = ctx.store.cart().retry().await.unwrap();
    assert_eq!(recovered.phase, CartPhase::Idle);
    assert!(recovered.error.is_none());
    assert_eq!(recovered.lines.len(), 1);
}

#[tokio::test]
async fn test_rejected_session_discards_cart() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "M", 1).await;

    ctx.backend
        .fail_next_query(GatewayError::Unauthorized("JWT expired".to_owned()));
    let err = ctx.store.cart().retry().await.unwrap_err();

    assert!(matches!(err, StorefrontError::AuthExpired));
    assert_eq!(ctx.store.session().status(), SessionStatus::Expired);
    assert!(ctx.store.cart().snapshot().is_empty());
    // The backend still holds the line for the next sign-in.
    assert_eq!(ctx.cart_rows().len(), 1);
}

#[tokio::test]
async fn test_sign_out_empties_cart() {
    let ctx = TestContext::signed_in().await;
    add_tee(&ctx, "M", 1).await;

    ctx.store.session().sign_out();
    let snapshot = ctx.store.cart().refresh().await.unwrap();
    assert!(snapshot.is_empty());
    assert!(!snapshot.loaded);

    ctx.sign_in();
    let snapshot = ctx.store.cart().refresh().await.unwrap();
    assert_eq!(snapshot.lines.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_is_flagged() {
    let ctx = TestContext::signed_in().await;
    ctx.backend.hold_queries(true);

    let cart = ctx.store.cart().clone();
    let pending = tokio::spawn(async move { cart.refresh().await });
    ctx.backend.wait_for_held_queries(1).await;
    assert!(!ctx.store.cart().snapshot().slow);

    tokio::time::advance(Duration::from_secs(11)).await;
    eventually("slow flag", || async { ctx.store.cart().snapshot().slow }).await;
    assert_eq!(ctx.store.cart().snapshot().phase, CartPhase::Fetching);

    ctx.backend.release_all();
    let snapshot = pending.await.unwrap().unwrap();
    assert!(!snapshot.slow);
    assert!(snapshot.loaded);
}

#[tokio::test(start_paused = true)]
async fn test_missed_change_is_picked_up_when_stale() {
    let ctx = TestContext::signed_in().await;
    let cart = ctx.store.cart();
    let _watch = cart.watch_realtime();
    eventually("initial load", || async { cart.snapshot().loaded }).await;

    // Written behind the channel's back: no change event is sent.
    ctx.backend.seed(
        "cart_items",
        [json!({
            "id": "line-missed",
            "user_id": ctx.user.as_str(),
            "product_id": "p-tote",
            "quantity": 2,
            "selected_size": null,
            "selected_color": null,
            "created_at": "2024-06-01T00:00:00Z",
        })],
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cart.snapshot().is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    eventually("stale refetch", || async { cart.snapshot().lines.len() == 1 }).await;
    let line = &cart.snapshot().lines[0];
    assert_eq!(line.id.as_str(), "line-missed");
    assert_eq!(line.quantity, 2);
}
