//! In-process backend for tests.
//!
//! Evaluates [`RowQuery`]/[`Mutation`] descriptions against JSON rows held in
//! memory, implements the stored procedures the storefront calls, and fans
//! row changes out to subscribers. Test hooks allow failure injection, call
//! counting, and holding query responses so their arrival order can be
//! controlled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use urban_threads_core::UserId;

use super::{
    ChangeEvent, ChangeKind, ChannelScope, Embed, Gateway, GatewayError, Mutation, MutationKind,
    RowQuery, Subscription,
};

/// First `created_at` handed out; each insert adds one second.
const EPOCH_SECS: i64 = 1_700_000_000;

/// In-memory [`Gateway`] implementation.
pub struct InMemoryBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    current_user: Mutex<Option<UserId>>,
    sequence: AtomicI64,

    query_count: AtomicUsize,
    mutation_count: AtomicUsize,
    procedure_count: AtomicUsize,
    subscribe_count: AtomicUsize,

    fail_query: Mutex<Option<GatewayError>>,
    fail_mutation: Mutex<Option<GatewayError>>,
    fail_procedure: Mutex<Option<GatewayError>>,
    fail_subscribe: Mutex<Option<GatewayError>>,

    holding: AtomicBool,
    held: Mutex<Vec<oneshot::Sender<()>>>,
    held_count: watch::Sender<usize>,

    changes: broadcast::Sender<(String, ChangeKind, Value)>,
    kill: watch::Sender<u64>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            tables: Mutex::new(HashMap::new()),
            current_user: Mutex::new(None),
            sequence: AtomicI64::new(0),
            query_count: AtomicUsize::new(0),
            mutation_count: AtomicUsize::new(0),
            procedure_count: AtomicUsize::new(0),
            subscribe_count: AtomicUsize::new(0),
            fail_query: Mutex::new(None),
            fail_mutation: Mutex::new(None),
            fail_procedure: Mutex::new(None),
            fail_subscribe: Mutex::new(None),
            holding: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            held_count: watch::Sender::new(0),
            changes,
            kill: watch::Sender::new(0),
        }
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    /// Insert rows directly, without change notifications or id assignment.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        with_lock(&self.tables, |tables| {
            tables.entry(table.to_owned()).or_default().extend(rows);
        });
    }

    /// Snapshot of a table's rows.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        with_lock(&self.tables, |tables| {
            tables.get(table).cloned().unwrap_or_default()
        })
    }

    /// Act as `user` for procedures that read the caller's identity.
    pub fn sign_in_as(&self, user: &UserId) {
        with_lock(&self.current_user, |current| *current = Some(user.clone()));
    }

    pub fn sign_out(&self) {
        with_lock(&self.current_user, |current| *current = None);
    }

    /// Simulate a change made by another client: apply it and notify.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Gateway::mutate`].
    pub fn apply_external(&self, mutation: &Mutation) -> Result<Vec<Value>, GatewayError> {
        self.apply_mutation(mutation)
    }

    #[must_use]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutation_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn procedure_count(&self) -> usize {
        self.procedure_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    pub fn fail_next_query(&self, error: GatewayError) {
        with_lock(&self.fail_query, |slot| *slot = Some(error));
    }

    pub fn fail_next_mutation(&self, error: GatewayError) {
        with_lock(&self.fail_mutation, |slot| *slot = Some(error));
    }

    pub fn fail_next_procedure(&self, error: GatewayError) {
        with_lock(&self.fail_procedure, |slot| *slot = Some(error));
    }

    pub fn fail_next_subscribe(&self, error: GatewayError) {
        with_lock(&self.fail_subscribe, |slot| *slot = Some(error));
    }

    /// Close every open change feed, as a dropped socket would.
    pub fn drop_subscriptions(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    // =========================================================================
    // Response ordering
    // =========================================================================

    /// While enabled, query responses are computed on arrival but not
    /// returned until released.
    pub fn hold_queries(&self, hold: bool) {
        self.holding.store(hold, Ordering::SeqCst);
    }

    #[must_use]
    pub fn held_queries(&self) -> usize {
        with_lock(&self.held, |held| held.len())
    }

    /// Wait until at least `count` queries are parked.
    pub async fn wait_for_held_queries(&self, count: usize) {
        let mut rx = self.held_count.subscribe();
        let _ = rx.wait_for(|held| *held >= count).await;
    }

    /// Release the most recently parked query.
    pub fn release_newest_query(&self) {
        let gate = with_lock(&self.held, Vec::pop);
        self.release(gate);
    }

    /// Release the earliest parked query.
    pub fn release_oldest_query(&self) {
        let gate = with_lock(&self.held, |held| {
            (!held.is_empty()).then(|| held.remove(0))
        });
        self.release(gate);
    }

    pub fn release_all(&self) {
        self.hold_queries(false);
        let gates = with_lock(&self.held, std::mem::take);
        self.held_count.send_replace(0);
        for gate in gates {
            let _ = gate.send(());
        }
    }

    fn release(&self, gate: Option<oneshot::Sender<()>>) {
        if let Some(gate) = gate {
            self.held_count.send_modify(|held| *held = held.saturating_sub(1));
            let _ = gate.send(());
        }
    }

    async fn park(&self) {
        if !self.holding.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        with_lock(&self.held, |held| held.push(tx));
        self.held_count.send_modify(|held| *held += 1);
        let _ = rx.await;
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    fn run_query(&self, query: &RowQuery) -> Vec<Value> {
        let tables = with_lock(&self.tables, |tables| tables.clone());
        let empty = Vec::new();
        let rows = tables.get(&query.table).unwrap_or(&empty);

        let mut matched: Vec<Value> = rows
            .iter()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .filter_map(|row| embed_related(row, &query.embeds, &tables))
            .collect();

        matched.sort_by(|a, b| {
            query
                .order
                .iter()
                .map(|o| o.compare_rows(a, b))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        if query.columns.is_empty() {
            return matched;
        }
        matched
            .into_iter()
            .map(|row| {
                let mut keep: Vec<&str> = query.columns.iter().map(String::as_str).collect();
                keep.extend(query.embeds.iter().map(|e| e.table.as_str()));
                project(&row, &keep)
            })
            .collect()
    }

    fn apply_mutation(&self, mutation: &Mutation) -> Result<Vec<Value>, GatewayError> {
        let affected = match mutation.kind {
            MutationKind::Insert => {
                let rows: Vec<Value> = match &mutation.payload {
                    Value::Array(rows) => rows.clone(),
                    row => vec![row.clone()],
                };
                let rows = rows
                    .into_iter()
                    .map(|row| self.stamp(row))
                    .collect::<Vec<_>>();
                for row in &rows {
                    check_constraints(&mutation.table, row)?;
                }
                with_lock(&self.tables, |tables| {
                    tables
                        .entry(mutation.table.clone())
                        .or_default()
                        .extend(rows.iter().cloned());
                });
                rows
            }
            MutationKind::Update => {
                let Value::Object(changes) = &mutation.payload else {
                    return Err(GatewayError::Status {
                        status: 400,
                        message: "update payload must be an object".to_owned(),
                    });
                };
                with_lock(&self.tables, |tables| {
                    let rows = tables.entry(mutation.table.clone()).or_default();
                    let mut updated = Vec::new();
                    for row in rows.iter() {
                        if mutation.filters.iter().all(|f| f.matches(row)) {
                            let merged = merge(row, changes);
                            check_constraints(&mutation.table, &merged)?;
                            updated.push(merged);
                        }
                    }
                    for row in rows.iter_mut() {
                        if mutation.filters.iter().all(|f| f.matches(row)) {
                            *row = merge(row, changes);
                        }
                    }
                    Ok::<_, GatewayError>(updated)
                })?
            }
            MutationKind::Delete => with_lock(&self.tables, |tables| {
                let rows = tables.entry(mutation.table.clone()).or_default();
                let (removed, kept): (Vec<Value>, Vec<Value>) = std::mem::take(rows)
                    .into_iter()
                    .partition(|row| mutation.filters.iter().all(|f| f.matches(row)));
                *rows = kept;
                removed
            }),
        };

        let kind = ChangeKind::from(mutation.kind);
        for row in &affected {
            let _ = self
                .changes
                .send((mutation.table.clone(), kind, row.clone()));
        }
        Ok(affected)
    }

    /// Fill in `id` and `created_at` the way column defaults would.
    fn stamp(&self, row: Value) -> Value {
        let Value::Object(mut row) = row else {
            return row;
        };
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        row.entry("id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        row.entry("created_at").or_insert_with(|| {
            DateTime::<Utc>::from_timestamp(EPOCH_SECS + seq, 0)
                .map_or(Value::Null, |at| Value::String(at.to_rfc3339()))
        });
        Value::Object(row)
    }

    fn run_procedure(&self, name: &str, args: &Value) -> Result<Value, GatewayError> {
        match name {
            "add_to_cart" => self.add_to_cart(args),
            "search_products" => {
                let term = args["search_term"].as_str().unwrap_or_default().trim();
                let pattern = format!("%{term}%");
                let rows = self.rows("products");
                let found: Vec<Value> = rows
                    .into_iter()
                    .filter(|row| {
                        ["name", "category", "description"]
                            .iter()
                            .any(|column| super::Filter::ilike(column, pattern.clone()).matches(row))
                    })
                    .collect();
                Ok(Value::Array(found))
            }
            "get_category_counts" => {
                let mut counts: Vec<(String, u64)> = Vec::new();
                for row in self.rows("products") {
                    let Some(category) = row["category"].as_str() else {
                        continue;
                    };
                    match counts.iter_mut().find(|(c, _)| c == category) {
                        Some((_, n)) => *n += 1,
                        None => counts.push((category.to_owned(), 1)),
                    }
                }
                counts.sort();
                Ok(Value::Array(
                    counts
                        .into_iter()
                        .map(|(category, count)| json!({ "category": category, "product_count": count }))
                        .collect(),
                ))
            }
            other => Err(procedure_error(other, "function does not exist")),
        }
    }

    fn add_to_cart(&self, args: &Value) -> Result<Value, GatewayError> {
        const NAME: &str = "add_to_cart";

        let user = with_lock(&self.current_user, |current| current.clone())
            .ok_or_else(|| GatewayError::Unauthorized("not authenticated".to_owned()))?;
        let product_id = args["p_product_id"].as_str().unwrap_or_default();
        let quantity = args["p_quantity"].as_i64().unwrap_or(0);
        let size = args["p_size"].as_str();
        let color = args["p_color"].as_str();

        if quantity < 1 {
            return Err(procedure_error(NAME, "quantity must be at least 1"));
        }

        let product = self
            .rows("products")
            .into_iter()
            .find(|row| row["id"] == product_id)
            .ok_or_else(|| procedure_error(NAME, "product not found"))?;

        if !option_allowed(&product["sizes"], size) {
            return Err(procedure_error(NAME, "invalid size for product"));
        }
        if !option_allowed(&product["colors"], color) {
            return Err(procedure_error(NAME, "invalid color for product"));
        }

        let existing = self.rows("cart_items").into_iter().find(|row| {
            row["user_id"] == user.as_str()
                && row["product_id"] == product_id
                && row["selected_size"].as_str() == size
                && row["selected_color"].as_str() == color
        });
        let current = existing
            .as_ref()
            .and_then(|row| row["quantity"].as_i64())
            .unwrap_or(0);
        let wanted = current + quantity;

        if product["stock_quantity"]
            .as_i64()
            .is_some_and(|stock| wanted > stock)
        {
            return Err(procedure_error(NAME, "insufficient stock"));
        }

        let rows = if let Some(line) = existing {
            self.apply_mutation(
                &Mutation::update("cart_items", json!({ "quantity": wanted }))
                    .filter(super::Filter::eq("id", line["id"].clone())),
            )?
        } else {
            self.apply_mutation(&Mutation::insert(
                "cart_items",
                json!({
                    "user_id": user.as_str(),
                    "product_id": product_id,
                    "quantity": quantity,
                    "selected_size": size,
                    "selected_color": color,
                }),
            ))?
        };
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }
}

impl Gateway for InMemoryBackend {
    async fn query(&self, query: &RowQuery) -> Result<Vec<Value>, GatewayError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let result = match with_lock(&self.fail_query, Option::take) {
            Some(error) => Err(error),
            None => Ok(self.run_query(query)),
        };
        self.park().await;
        result
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Vec<Value>, GatewayError> {
        self.mutation_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = with_lock(&self.fail_mutation, Option::take) {
            return Err(error);
        }
        self.apply_mutation(mutation)
    }

    async fn call_procedure(&self, name: &str, args: Value) -> Result<Value, GatewayError> {
        self.procedure_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = with_lock(&self.fail_procedure, Option::take) {
            return Err(error);
        }
        self.run_procedure(name, &args)
    }

    async fn subscribe(&self, scope: &ChannelScope) -> Result<Subscription, GatewayError> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = with_lock(&self.fail_subscribe, Option::take) {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(32);
        let mut changes = self.changes.subscribe();
        let mut kill = self.kill.subscribe();
        let scope = scope.clone();

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok((table, kind, row)) => {
                            if scope.covers(&table, &row) {
                                let _ = tx.try_send(ChangeEvent { table, kind });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let _ = tx.try_send(ChangeEvent {
                                table: scope.table.clone(),
                                kind: ChangeKind::Update,
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = kill.changed() => break,
                }
            }
        });

        Ok(Subscription::new(rx, Some(pump)))
    }
}

fn with_lock<T, R>(mutex: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

fn procedure_error(name: &str, message: &str) -> GatewayError {
    GatewayError::Procedure {
        name: name.to_owned(),
        message: message.to_owned(),
    }
}

/// A product with no options accepts no selection; otherwise the selection
/// must be one of the listed values.
fn option_allowed(options: &Value, selected: Option<&str>) -> bool {
    match (options.as_array(), selected) {
        (None, None) => true,
        (Some(list), None) => list.is_empty(),
        (Some(list), Some(value)) => list.iter().any(|v| v == value),
        (None, Some(_)) => false,
    }
}

fn check_constraints(table: &str, row: &Value) -> Result<(), GatewayError> {
    if table == "cart_items" && row["quantity"].as_i64().is_some_and(|q| q < 1) {
        return Err(GatewayError::Status {
            status: 400,
            message: "new row violates check constraint \"cart_items_quantity_check\"".to_owned(),
        });
    }
    Ok(())
}

fn merge(row: &Value, changes: &Map<String, Value>) -> Value {
    let mut merged = row.clone();
    if let Value::Object(fields) = &mut merged {
        for (key, value) in changes {
            fields.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn project(row: &Value, columns: &[&str]) -> Value {
    let mut out = Map::new();
    for column in columns {
        if let Some(value) = row.get(*column) {
            out.insert((*column).to_owned(), value.clone());
        }
    }
    Value::Object(out)
}

/// Attach related rows; `None` drops the row from an inner join.
fn embed_related(
    row: &Value,
    embeds: &[Embed],
    tables: &HashMap<String, Vec<Value>>,
) -> Option<Value> {
    let mut row = row.clone();
    for embed in embeds {
        let columns: Vec<&str> = embed.columns.iter().map(String::as_str).collect();
        let shape = |r: &Value| {
            if columns.is_empty() {
                r.clone()
            } else {
                project(r, &columns)
            }
        };
        let related_rows = tables.get(&embed.table).map_or(&[][..], Vec::as_slice);

        if embed.many {
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            let children: Vec<Value> = related_rows
                .iter()
                .filter(|r| !id.is_null() && r[&embed.foreign_key] == id)
                .map(shape)
                .collect();
            if let Value::Object(fields) = &mut row {
                fields.insert(embed.table.clone(), Value::Array(children));
            }
            continue;
        }

        let key = row.get(&embed.foreign_key).cloned().unwrap_or(Value::Null);
        let related = related_rows
            .iter()
            .find(|r| !key.is_null() && r["id"] == key)
            .map(shape);
        match related {
            Some(related) => {
                if let Value::Object(fields) = &mut row {
                    fields.insert(embed.table.clone(), related);
                }
            }
            None if embed.inner => return None,
            None => {
                if let Value::Object(fields) = &mut row {
                    fields.insert(embed.table.clone(), Value::Null);
                }
            }
        }
    }
    Some(row)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gateway::{Filter, SortOrder};

    fn backend_with_product(stock: Option<i64>) -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend.seed(
            "products",
            [json!({
                "id": "p-1",
                "name": "Linen Shirt",
                "category": "shirts",
                "description": "Breathable linen",
                "price": 89_000,
                "stock_quantity": stock,
                "sizes": ["S", "M"],
                "colors": ["White"],
            })],
        );
        backend.sign_in_as(&UserId::new("u-1"));
        backend
    }

    fn add_args(quantity: i64) -> Value {
        json!({
            "p_product_id": "p-1",
            "p_quantity": quantity,
            "p_size": "M",
            "p_color": "White",
        })
    }

    #[tokio::test]
    async fn test_add_to_cart_merges_identical_lines() {
        let backend = backend_with_product(Some(10));
        backend.call_procedure("add_to_cart", add_args(2)).await.unwrap();
        backend.call_procedure("add_to_cart", add_args(3)).await.unwrap();

        let lines = backend.rows("cart_items");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["quantity"], 5);
    }

    #[tokio::test]
    async fn test_add_to_cart_rejects_over_stock_and_bad_options() {
        let backend = backend_with_product(Some(2));
        let err = backend
            .call_procedure("add_to_cart", add_args(3))
            .await
            .unwrap_err();
        assert_eq!(err, procedure_error("add_to_cart", "insufficient stock"));

        let mut args = add_args(1);
        args["p_size"] = json!("XXL");
        assert!(backend.call_procedure("add_to_cart", args).await.is_err());
        assert!(backend.rows("cart_items").is_empty());
    }

    #[tokio::test]
    async fn test_query_embeds_filters_and_orders() {
        let backend = backend_with_product(None);
        backend.call_procedure("add_to_cart", add_args(1)).await.unwrap();
        backend.seed(
            "cart_items",
            [json!({ "id": "orphan", "user_id": "u-1", "product_id": "gone", "quantity": 1 })],
        );

        let query = RowQuery::table("cart_items")
            .filter(Filter::eq("user_id", "u-1"))
            .embed(Embed::inner("products", "product_id", &["id", "name", "price"]))
            .order(SortOrder::desc("created_at"));
        let rows = backend.query(&query).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["products"]["name"], "Linen Shirt");
        assert!(rows[0]["products"].get("sizes").is_none());
    }

    #[tokio::test]
    async fn test_quantity_check_constraint() {
        let backend = backend_with_product(None);
        backend.call_procedure("add_to_cart", add_args(1)).await.unwrap();
        let err = backend
            .mutate(&Mutation::update("cart_items", json!({ "quantity": 0 })))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 400, .. }));
        assert_eq!(backend.rows("cart_items")[0]["quantity"], 1);
    }

    #[tokio::test]
    async fn test_subscription_receives_scoped_changes_and_drops() {
        let backend = backend_with_product(None);
        let scope = ChannelScope::table("cart_items").where_eq("user_id", "u-1");
        let mut sub = backend.subscribe(&scope).await.unwrap();

        backend
            .apply_external(&Mutation::insert(
                "cart_items",
                json!({ "user_id": "u-2", "product_id": "p-1", "quantity": 1 }),
            ))
            .unwrap();
        backend.call_procedure("add_to_cart", add_args(1)).await.unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.table, "cart_items");
        assert_eq!(event.kind, ChangeKind::Insert);

        backend.drop_subscriptions();
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_held_queries_release_in_chosen_order() {
        let backend = std::sync::Arc::new(backend_with_product(None));
        backend.hold_queries(true);

        let first = tokio::spawn({
            let backend = backend.clone();
            async move { backend.query(&RowQuery::table("products")).await }
        });
        backend.wait_for_held_queries(1).await;
        backend.seed("products", [json!({ "id": "p-2", "name": "Tee" })]);
        let second = tokio::spawn({
            let backend = backend.clone();
            async move { backend.query(&RowQuery::table("products")).await }
        });
        backend.wait_for_held_queries(2).await;

        backend.release_newest_query();
        assert_eq!(second.await.unwrap().unwrap().len(), 2);
        backend.release_oldest_query();
        assert_eq!(first.await.unwrap().unwrap().len(), 1);
    }
}
