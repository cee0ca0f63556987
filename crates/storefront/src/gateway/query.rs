//! Query, mutation and channel descriptions shared by every gateway.
//!
//! These are plain data. [`rest`](super::rest) renders them as `PostgREST`
//! query parameters; the in-memory backend evaluates them directly.

use std::cmp::Ordering;

use serde_json::Value;

/// Comparison operator for a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gte,
    Lte,
    /// Case-insensitive `LIKE` with `%` wildcards.
    Ilike,
    IsNull,
    NotNull,
}

/// A single `column <op> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// `column = value`.
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value.into())
    }

    /// `column <> value`.
    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Neq, value.into())
    }

    /// `column >= value`.
    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Gte, value.into())
    }

    /// `column <= value`.
    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Lte, value.into())
    }

    /// `column ILIKE pattern`.
    pub fn ilike(column: &str, pattern: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Ilike, Value::String(pattern.into()))
    }

    /// `column IS NULL`.
    #[must_use]
    pub fn is_null(column: &str) -> Self {
        Self::new(column, FilterOp::IsNull, Value::Null)
    }

    /// `column IS NOT NULL`.
    #[must_use]
    pub fn not_null(column: &str) -> Self {
        Self::new(column, FilterOp::NotNull, Value::Null)
    }

    fn new(column: &str, op: FilterOp, value: Value) -> Self {
        Self {
            column: column.to_owned(),
            op,
            value,
        }
    }

    /// Render the right-hand side of a `PostgREST` filter parameter.
    #[must_use]
    pub fn render(&self) -> String {
        let value = scalar_text(&self.value);
        match self.op {
            FilterOp::Eq => format!("eq.{value}"),
            FilterOp::Neq => format!("neq.{value}"),
            FilterOp::Gte => format!("gte.{value}"),
            FilterOp::Lte => format!("lte.{value}"),
            FilterOp::Ilike => format!("ilike.{value}"),
            FilterOp::IsNull => "is.null".to_owned(),
            FilterOp::NotNull => "not.is.null".to_owned(),
        }
    }

    /// Evaluate the filter against a row with SQL null semantics.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::IsNull => field.is_null(),
            FilterOp::NotNull => !field.is_null(),
            _ if field.is_null() => false,
            FilterOp::Eq => compare(field, &self.value) == Some(Ordering::Equal),
            FilterOp::Neq => compare(field, &self.value) != Some(Ordering::Equal),
            FilterOp::Gte => matches!(
                compare(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lte => matches!(
                compare(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Ilike => match (field.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => ilike(text, pattern),
                _ => false,
            },
        }
    }
}

/// Sort key for a row query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub column: String,
    pub ascending: bool,
    pub nulls_last: bool,
}

impl SortOrder {
    #[must_use]
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_owned(),
            ascending: true,
            nulls_last: true,
        }
    }

    #[must_use]
    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_owned(),
            ascending: false,
            nulls_last: true,
        }
    }

    fn render(&self) -> String {
        let direction = if self.ascending { "asc" } else { "desc" };
        let nulls = if self.nulls_last { "nullslast" } else { "nullsfirst" };
        format!("{}.{direction}.{nulls}", self.column)
    }

    /// Compare two rows by this key.
    #[must_use]
    pub fn compare_rows(&self, a: &Value, b: &Value) -> Ordering {
        let left = a.get(&self.column).unwrap_or(&Value::Null);
        let right = b.get(&self.column).unwrap_or(&Value::Null);
        match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_last {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                if self.nulls_last {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => {
                let ord = compare(left, right).unwrap_or(Ordering::Equal);
                if self.ascending { ord } else { ord.reverse() }
            }
        }
    }
}

/// A related table pulled into each row through a foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    /// Related table name; also the key the related rows appear under.
    pub table: String,
    /// For a single embed, the column on the outer row holding the related
    /// row's `id`. For a many embed, the column on the related rows holding
    /// the outer row's `id`.
    pub foreign_key: String,
    pub columns: Vec<String>,
    /// Drop outer rows without a related row.
    pub inner: bool,
    /// Embed every referencing row as an array.
    pub many: bool,
}

impl Embed {
    /// The one row the outer row points at; rows without one are dropped.
    #[must_use]
    pub fn inner(table: &str, foreign_key: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_owned(),
            foreign_key: foreign_key.to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            inner: true,
            many: false,
        }
    }

    /// Every row of `table` whose `foreign_key` points at the outer row.
    #[must_use]
    pub fn many(table: &str, foreign_key: &str, columns: &[&str]) -> Self {
        Self {
            inner: false,
            many: true,
            ..Self::inner(table, foreign_key, columns)
        }
    }

    fn render(&self) -> String {
        let hint = if self.inner { "!inner" } else { "" };
        format!("{}{hint}({})", self.table, self.columns.join(","))
    }
}

/// A read against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub table: String,
    /// Selected columns; empty selects everything.
    pub columns: Vec<String>,
    pub embeds: Vec<Embed>,
    pub filters: Vec<Filter>,
    pub order: Vec<SortOrder>,
    pub limit: Option<usize>,
}

impl RowQuery {
    #[must_use]
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            columns: Vec::new(),
            embeds: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order.push(order);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The `select` parameter value.
    #[must_use]
    pub fn select_clause(&self) -> String {
        let mut parts: Vec<String> = if self.columns.is_empty() {
            vec!["*".to_owned()]
        } else {
            self.columns.clone()
        };
        parts.extend(self.embeds.iter().map(Embed::render));
        parts.join(",")
    }

    /// Render as `PostgREST` query parameters.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_owned(), self.select_clause())];
        params.extend(filter_params(&self.filters));
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(SortOrder::render)
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_owned(), order));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_owned(), limit.to_string()));
        }
        params
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// A write against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub kind: MutationKind,
    /// Object (or array of objects for bulk insert); `Null` for deletes.
    pub payload: Value,
    pub filters: Vec<Filter>,
}

impl Mutation {
    #[must_use]
    pub fn insert(table: &str, payload: Value) -> Self {
        Self::new(table, MutationKind::Insert, payload)
    }

    #[must_use]
    pub fn update(table: &str, payload: Value) -> Self {
        Self::new(table, MutationKind::Update, payload)
    }

    #[must_use]
    pub fn delete(table: &str) -> Self {
        Self::new(table, MutationKind::Delete, Value::Null)
    }

    fn new(table: &str, kind: MutationKind, payload: Value) -> Self {
        Self {
            table: table.to_owned(),
            kind,
            payload,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Render the filters as `PostgREST` query parameters.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        filter_params(&self.filters).collect()
    }
}

/// Operation carried by a realtime change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parse the backend's upper-case event type.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl From<MutationKind> for ChangeKind {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Insert => Self::Insert,
            MutationKind::Update => Self::Update,
            MutationKind::Delete => Self::Delete,
        }
    }
}

/// "Something changed in scope X." Payloads are deliberately not carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
}

/// Rows a realtime channel listens to: a table, optionally narrowed by one
/// equality filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelScope {
    pub table: String,
    pub filter: Option<Filter>,
}

impl ChannelScope {
    #[must_use]
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            filter: None,
        }
    }

    /// Narrow to rows where `column = value`.
    pub fn where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filter = Some(Filter::eq(column, value));
        self
    }

    /// Filter string in `column=eq.value` form, as the realtime join expects.
    #[must_use]
    pub fn filter_clause(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|f| format!("{}={}", f.column, f.render()))
    }

    /// Channel topic name.
    #[must_use]
    pub fn topic(&self) -> String {
        match self.filter_clause() {
            Some(filter) => format!("realtime:public:{}:{filter}", self.table),
            None => format!("realtime:public:{}", self.table),
        }
    }

    /// Whether a row change in `table` falls inside this scope.
    #[must_use]
    pub fn covers(&self, table: &str, row: &Value) -> bool {
        self.table == table && self.filter.as_ref().is_none_or(|f| f.matches(row))
    }
}

fn filter_params(filters: &[Filter]) -> impl Iterator<Item = (String, String)> + '_ {
    filters.iter().map(|f| (f.column.clone(), f.render()))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// Case-insensitive match of `text` against a `%`-wildcard pattern.
fn ilike(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let segments: Vec<&str> = pattern.split('%').collect();

    let Some((first, rest)) = segments.split_first() else {
        return text.is_empty();
    };
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for segment in middle {
        match remaining.split_once(segment) {
            Some((_, after)) => remaining = after,
            None => return false,
        }
    }
    remaining.ends_with(last)
}
