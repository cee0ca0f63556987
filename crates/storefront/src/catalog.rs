//! Read-only catalog queries.
//!
//! Everything here is cached with the catalog policy. Listings additionally
//! carry a generation number: when the filter changes quickly, only the
//! response to the newest request is displayed, whatever order the
//! responses arrive in.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, instrument};
use urban_threads_core::ProductId;

use crate::cache::{CachePolicy, QueryCache, keys};
use crate::error::{Result, StorefrontError};
use crate::gateway::{
    Filter, Gateway, GatewayError, RowQuery, SortOrder, decode_row, decode_rows,
};
use crate::models::{CategoryCount, Product};

const PRODUCTS_TABLE: &str = "products";
const LISTING_LIMIT: usize = 100;
const RELATED_LIMIT: usize = 4;
const FEATURED_LIMIT: usize = 8;
const NEW_ARRIVALS_LIMIT: usize = 8;

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProductSort {
    #[default]
    Name,
    PriceLow,
    PriceHigh,
    Rating,
    Newest,
}

impl ProductSort {
    pub const ALL: [Self; 5] = [
        Self::Name,
        Self::PriceLow,
        Self::PriceHigh,
        Self::Rating,
        Self::Newest,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::PriceLow => "price-low",
            Self::PriceHigh => "price-high",
            Self::Rating => "rating",
            Self::Newest => "newest",
        }
    }

    fn order(self) -> SortOrder {
        match self {
            Self::Name => SortOrder::asc("name"),
            Self::PriceLow => SortOrder::asc("price"),
            Self::PriceHigh => SortOrder::desc("price"),
            Self::Rating => SortOrder::desc("rating"),
            Self::Newest => SortOrder::desc("created_at"),
        }
    }
}

impl fmt::Display for ProductSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sort| sort.as_str() == s)
            .ok_or_else(|| format!("Invalid sort: {s}"))
    }
}

/// What a listing shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingFilter {
    /// `None` (or "all") lists every category.
    pub category: Option<String>,
    /// Case-insensitive substring of the product name.
    pub name: Option<String>,
    pub sort: ProductSort,
}

impl ListingFilter {
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty() && *c != "all")
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }

    fn cache_key(&self) -> String {
        keys::listing(
            self.category().unwrap_or("all"),
            self.sort.as_str(),
            self.name().unwrap_or_default(),
        )
    }

    fn query(&self) -> RowQuery {
        let mut query = RowQuery::table(PRODUCTS_TABLE).columns(Product::CARD_COLUMNS);
        if let Some(category) = self.category() {
            query = query.filter(Filter::eq("category", category));
        }
        if let Some(name) = self.name() {
            query = query.filter(Filter::ilike("name", format!("%{name}%")));
        }
        query.order(self.sort.order()).limit(LISTING_LIMIT)
    }
}

/// A displayed listing and the filter that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub filter: ListingFilter,
    pub products: Vec<Product>,
}

/// Catalog reads. Cheaply cloneable.
pub struct Catalog<G> {
    inner: Arc<CatalogInner<G>>,
}

impl<G> Clone for Catalog<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CatalogInner<G> {
    gateway: Arc<G>,
    policy: CachePolicy,
    products: QueryCache<Vec<Product>>,
    product: QueryCache<Product>,
    categories: QueryCache<Vec<CategoryCount>>,
    listing_generation: AtomicU64,
    listing: watch::Sender<Option<Listing>>,
}

impl<G: Gateway> Catalog<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                gateway,
                policy,
                products: QueryCache::new(),
                product: QueryCache::new(),
                categories: QueryCache::new(),
                listing_generation: AtomicU64::new(0),
                listing: watch::Sender::new(None),
            }),
        }
    }

    /// One product with every column.
    ///
    /// # Errors
    ///
    /// Returns a not-found gateway error if no product has this id.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn product(&self, id: &ProductId) -> Result<Product> {
        let query = RowQuery::table(PRODUCTS_TABLE).filter(Filter::eq("id", id.as_str()));
        let gateway = Arc::clone(&self.inner.gateway);
        let what = format!("product {id}");
        let product = self
            .inner
            .product
            .get_or_fetch(&keys::product(id), self.inner.policy, move || {
                async move { decode_row(gateway.query(&query).await?, &what) }.boxed()
            })
            .await?;
        Ok(product)
    }

    /// List products and make the result the displayed listing.
    ///
    /// # Errors
    ///
    /// Returns [`StorefrontError::StaleResponse`] if another listing was
    /// requested while this one was in flight; the newer one wins.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: ListingFilter) -> Result<Listing> {
        let generation = self.inner.listing_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self
            .inner
            .products
            .get_or_fetch(
                &filter.cache_key(),
                self.inner.policy,
                fetch_rows(&self.inner.gateway, filter.query()),
            )
            .await;

        if self.inner.listing_generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Discarding superseded listing");
            return Err(StorefrontError::StaleResponse);
        }
        let listing = Listing {
            filter,
            products: result?,
        };
        self.inner.listing.send_replace(Some(listing.clone()));
        Ok(listing)
    }

    /// The listing currently displayed.
    #[must_use]
    pub fn current_listing(&self) -> Option<Listing> {
        self.inner.listing.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_listing(&self) -> watch::Receiver<Option<Listing>> {
        self.inner.listing.subscribe()
    }

    /// Up to four other products from the same category.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error.
    pub async fn related(&self, product: &Product) -> Result<Vec<Product>> {
        let Some(category) = product.category.as_deref() else {
            return Ok(Vec::new());
        };
        let query = RowQuery::table(PRODUCTS_TABLE)
            .columns(Product::CARD_COLUMNS)
            .filter(Filter::eq("category", category))
            .filter(Filter::neq("id", product.id.as_str()))
            .limit(RELATED_LIMIT);
        self.cached_products(&keys::related(category, &product.id), query)
            .await
    }

    /// Best-rated products that have an image and are in stock.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error.
    pub async fn featured(&self) -> Result<Vec<Product>> {
        let query = RowQuery::table(PRODUCTS_TABLE)
            .columns(Product::CARD_COLUMNS)
            .filter(Filter::not_null("image_url"))
            .filter(Filter::gte("stock_quantity", 1))
            .order(SortOrder::desc("rating"))
            .limit(FEATURED_LIMIT);
        self.cached_products(&keys::featured(), query).await
    }

    /// Products flagged as new, latest first.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error.
    pub async fn new_arrivals(&self) -> Result<Vec<Product>> {
        let query = RowQuery::table(PRODUCTS_TABLE)
            .columns(Product::CARD_COLUMNS)
            .filter(Filter::eq("is_new", true))
            .order(SortOrder::desc("created_at"))
            .limit(NEW_ARRIVALS_LIMIT);
        self.cached_products(&keys::new_arrivals(), query).await
    }

    /// Full-text search through the `search_products` procedure.
    ///
    /// A blank term returns nothing without calling the backend.
    ///
    /// # Errors
    ///
    /// Returns the procedure's error.
    #[instrument(skip(self))]
    pub async fn search(&self, term: &str) -> Result<Vec<Product>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let fetch = fetch_procedure(
            &self.inner.gateway,
            "search_products",
            json!({ "search_term": term }),
        );
        Ok(self
            .inner
            .products
            .get_or_fetch(&keys::search(term), self.inner.policy, fetch)
            .await?)
    }

    /// Product count per category.
    ///
    /// # Errors
    ///
    /// Returns the procedure's error.
    pub async fn category_counts(&self) -> Result<Vec<CategoryCount>> {
        let fetch = fetch_procedure(&self.inner.gateway, "get_category_counts", json!({}));
        Ok(self
            .inner
            .categories
            .get_or_fetch(&keys::category_counts(), self.inner.policy, fetch)
            .await?)
    }

    /// Forget every cached catalog read.
    pub async fn invalidate(&self) {
        self.inner.products.clear().await;
        self.inner.product.clear().await;
        self.inner.categories.clear().await;
    }

    async fn cached_products(&self, key: &str, query: RowQuery) -> Result<Vec<Product>> {
        Ok(self
            .inner
            .products
            .get_or_fetch(key, self.inner.policy, fetch_rows(&self.inner.gateway, query))
            .await?)
    }
}

fn fetch_rows<G, T>(
    gateway: &Arc<G>,
    query: RowQuery,
) -> impl FnOnce() -> BoxFuture<'static, std::result::Result<Vec<T>, GatewayError>> + Send
where
    G: Gateway,
    T: DeserializeOwned + Send + 'static,
{
    let gateway = Arc::clone(gateway);
    move || async move { decode_rows(gateway.query(&query).await?) }.boxed()
}

fn fetch_procedure<G, T>(
    gateway: &Arc<G>,
    name: &'static str,
    args: Value,
) -> impl FnOnce() -> BoxFuture<'static, std::result::Result<Vec<T>, GatewayError>> + Send
where
    G: Gateway,
    T: DeserializeOwned + Send + 'static,
{
    let gateway = Arc::clone(gateway);
    move || {
        async move {
            match gateway.call_procedure(name, args).await? {
                Value::Null => Ok(Vec::new()),
                value => Ok(serde_json::from_value(value)?),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::gateway::memory::InMemoryBackend;

    fn seeded() -> (Arc<InMemoryBackend>, Catalog<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed(
            "products",
            [
                json!({"id": "p-1", "name": "Linen Shirt", "price": 89_000, "category": "shirts",
                       "rating": 4.5, "image_url": "linen.jpg", "stock_quantity": 4,
                       "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": "p-2", "name": "Oxford Shirt", "price": 79_000, "category": "shirts",
                       "rating": null, "image_url": "oxford.jpg", "stock_quantity": 10,
                       "is_new": true, "created_at": "2024-03-01T00:00:00Z"}),
                json!({"id": "p-3", "name": "Cargo Pants", "price": 120_000, "category": "pants",
                       "rating": 4.9, "image_url": null, "stock_quantity": 2,
                       "is_new": true, "created_at": "2024-02-01T00:00:00Z"}),
                json!({"id": "p-4", "name": "Denim Shirt", "price": 99_000, "category": "shirts",
                       "rating": 3.0, "image_url": "denim.jpg", "stock_quantity": 0,
                       "created_at": "2024-02-15T00:00:00Z"}),
            ],
        );
        let catalog = Catalog::new(Arc::clone(&backend), CachePolicy::catalog());
        (backend, catalog)
    }

    fn ids(products: &[Product]) -> Vec<&str> {
        products.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_sort_parse() {
        assert_eq!("price-high".parse::<ProductSort>().unwrap(), ProductSort::PriceHigh);
        assert!("cheapest".parse::<ProductSort>().is_err());
        for sort in ProductSort::ALL {
            assert_eq!(sort.as_str().parse::<ProductSort>().unwrap(), sort);
        }
    }

    #[tokio::test]
    async fn test_listing_filters_and_sorts() {
        let (_backend, catalog) = seeded();
        let listing = catalog
            .list(ListingFilter {
                category: Some("shirts".to_owned()),
                name: Some(" SHIRT ".to_owned()),
                sort: ProductSort::PriceLow,
            })
            .await
            .unwrap();
        assert_eq!(ids(&listing.products), ["p-2", "p-1", "p-4"]);

        let all = catalog
            .list(ListingFilter {
                category: Some("all".to_owned()),
                sort: ProductSort::Newest,
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&all.products), ["p-2", "p-4", "p-3", "p-1"]);
        assert_eq!(catalog.current_listing().unwrap(), all);
    }

    #[tokio::test]
    async fn test_superseded_listing_is_discarded() {
        let (backend, catalog) = seeded();
        backend.hold_queries(true);

        let first = tokio::spawn({
            let catalog = catalog.clone();
            async move {
                catalog
                    .list(ListingFilter {
                        category: Some("pants".to_owned()),
                        ..ListingFilter::default()
                    })
                    .await
            }
        });
        backend.wait_for_held_queries(1).await;

        let second = tokio::spawn({
            let catalog = catalog.clone();
            async move {
                catalog
                    .list(ListingFilter {
                        category: Some("shirts".to_owned()),
                        ..ListingFilter::default()
                    })
                    .await
            }
        });
        backend.wait_for_held_queries(2).await;

        backend.release_newest_query();
        let shown = second.await.unwrap().unwrap();
        backend.release_oldest_query();
        assert!(matches!(
            first.await.unwrap(),
            Err(StorefrontError::StaleResponse)
        ));

        assert_eq!(catalog.current_listing().unwrap(), shown);
        assert_eq!(shown.products.len(), 3);
    }

    #[tokio::test]
    async fn test_related_excludes_self() {
        let (_backend, catalog) = seeded();
        let shirt = catalog.product(&ProductId::new("p-1")).await.unwrap();
        let related = catalog.related(&shirt).await.unwrap();
        assert_eq!(related.len(), 2);
        assert!(related.iter().all(|p| p.id != shirt.id));
    }

    #[tokio::test]
    async fn test_missing_product_is_not_found() {
        let (_backend, catalog) = seeded();
        let err = catalog.product(&ProductId::new("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            StorefrontError::Gateway(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_featured_needs_image_and_stock() {
        let (_backend, catalog) = seeded();
        let featured = catalog.featured().await.unwrap();
        assert_eq!(ids(&featured), ["p-1", "p-2"]);
    }

    #[tokio::test]
    async fn test_new_arrivals_latest_first() {
        let (backend, catalog) = seeded();
        let arrivals = catalog.new_arrivals().await.unwrap();
        assert_eq!(ids(&arrivals), ["p-2", "p-3"]);
        assert!(arrivals.iter().all(|p| p.is_new));

        catalog.new_arrivals().await.unwrap();
        assert_eq!(backend.query_count(), 1);
    }

    #[tokio::test]
    async fn test_blank_search_skips_backend() {
        let (backend, catalog) = seeded();
        assert!(catalog.search("   ").await.unwrap().is_empty());
        assert_eq!(backend.procedure_count(), 0);

        let found = catalog.search("cargo").await.unwrap();
        assert_eq!(ids(&found), ["p-3"]);
        catalog.search("cargo").await.unwrap();
        assert_eq!(backend.procedure_count(), 1);
    }

    #[tokio::test]
    async fn test_category_counts() {
        let (_backend, catalog) = seeded();
        let counts = catalog.category_counts().await.unwrap();
        assert_eq!(
            counts,
            [
                CategoryCount {
                    category: "pants".to_owned(),
                    product_count: 1
                },
                CategoryCount {
                    category: "shirts".to_owned(),
                    product_count: 3
                },
            ]
        );
    }
}
