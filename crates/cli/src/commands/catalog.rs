//! Catalog commands.
//!
//! # Usage
//!
//! ```bash
//! ut-cli products list --category tops --name shirt --sort rating
//! ut-cli products featured
//! ut-cli products new
//! ut-cli products search denim
//! ut-cli products show <product-id>
//! ut-cli products categories
//! ```

use clap::Subcommand;
use urban_threads_core::ProductId;
use urban_threads_storefront::Storefront;
use urban_threads_storefront::catalog::{ListingFilter, ProductSort};
use urban_threads_storefront::currency::CurrencyPreference;
use urban_threads_storefront::gateway::Gateway;
use urban_threads_storefront::models::Product;

use super::CliError;

#[derive(Subcommand)]
pub enum ProductsAction {
    /// List products in a category
    List {
        /// Category, or "all"
        #[arg(short, long)]
        category: Option<String>,
        /// Case-insensitive name filter
        #[arg(short, long)]
        name: Option<String>,
        /// name, price-low, price-high, rating or newest
        #[arg(short, long, default_value = "name")]
        sort: ProductSort,
    },
    /// Highly rated products that are in stock
    Featured,
    /// Latest products flagged as new
    New,
    /// Full-text product search
    Search { term: String },
    /// One product with related products
    Show { id: String },
    /// Product count per category
    Categories,
}

pub async fn run<G: Gateway>(
    storefront: &Storefront<G>,
    action: ProductsAction,
) -> Result<(), CliError> {
    let catalog = storefront.catalog();
    let currency = storefront.currency();
    match action {
        ProductsAction::List {
            category,
            name,
            sort,
        } => {
            let listing = catalog
                .list(ListingFilter {
                    category,
                    name,
                    sort,
                })
                .await?;
            print_products(&listing.products, currency);
        }
        ProductsAction::Featured => print_products(&catalog.featured().await?, currency),
        ProductsAction::New => print_products(&catalog.new_arrivals().await?, currency),
        ProductsAction::Search { term } => print_products(&catalog.search(&term).await?, currency),
        ProductsAction::Show { id } => {
            let product = catalog.product(&ProductId::new(id)).await?;
            let related = catalog.related(&product).await?;
            #[allow(clippy::print_stdout)]
            {
                print_product(&product, currency);
                if let Some(description) = &product.description {
                    println!("  {description}");
                }
                if !product.sizes.is_empty() {
                    println!("  sizes: {}", product.sizes.join(", "));
                }
                if !product.colors.is_empty() {
                    println!("  colors: {}", product.colors.join(", "));
                }
                if !related.is_empty() {
                    println!("\nYou may also like:");
                    print_products(&related, currency);
                }
            }
        }
        ProductsAction::Categories => {
            #[allow(clippy::print_stdout)]
            for count in catalog.category_counts().await? {
                println!("{:<20} {}", count.category, count.product_count);
            }
        }
    }
    Ok(())
}

fn print_products(products: &[Product], currency: &CurrencyPreference) {
    if products.is_empty() {
        #[allow(clippy::print_stdout)]
        {
            println!("No products found.");
        }
    }
    for product in products {
        print_product(product, currency);
    }
}

#[allow(clippy::print_stdout)]
fn print_product(product: &Product, currency: &CurrencyPreference) {
    let stock = if product.is_out_of_stock() {
        " (out of stock)"
    } else {
        ""
    };
    println!(
        "{}  {:<32} {:>14}{stock}",
        product.id,
        product.name,
        currency.format(product.price)
    );
}
