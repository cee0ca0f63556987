//! Cart commands.
//!
//! # Usage
//!
//! ```bash
//! ut-cli cart show
//! ut-cli cart add <product-id> --quantity 2 --size M --color Black
//! ut-cli cart set <line-id> 3
//! ut-cli cart remove <line-id>
//! ut-cli cart watch
//! ```
//!
//! # Environment Variables
//!
//! - `STOREFRONT_EMAIL` / `STOREFRONT_PASSWORD` - Shopper credentials

use clap::Subcommand;
use urban_threads_core::{CartLineId, ProductId};
use urban_threads_storefront::cart::{CartPhase, CartSnapshot};
use urban_threads_storefront::currency::CurrencyPreference;
use urban_threads_storefront::gateway::Gateway;
use urban_threads_storefront::selection::ProductSelection;
use urban_threads_storefront::{Storefront, StorefrontError};

use super::CliError;

#[derive(Subcommand)]
pub enum CartAction {
    /// Show the cart and its totals
    Show,
    /// Add a product; the first size and color are used unless given
    Add {
        product_id: String,
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,
        #[arg(short, long)]
        size: Option<String>,
        #[arg(short, long)]
        color: Option<String>,
    },
    /// Set a line's quantity; 0 removes the line
    Set { line_id: String, quantity: i64 },
    /// Remove a line
    Remove { line_id: String },
    /// Print the cart every time it changes, until interrupted
    Watch,
}

pub async fn run<G: Gateway>(storefront: &Storefront<G>, action: CartAction) -> Result<(), CliError> {
    let cart = storefront.cart();
    match action {
        CartAction::Show => {}
        CartAction::Add {
            product_id,
            quantity,
            size,
            color,
        } => {
            let product = storefront
                .catalog()
                .product(&ProductId::new(product_id))
                .await?;
            let mut selection = ProductSelection::open(product);
            if size.is_some() {
                selection
                    .choose_size(size.as_deref())
                    .map_err(StorefrontError::from)?;
            }
            if color.is_some() {
                selection
                    .choose_color(color.as_deref())
                    .map_err(StorefrontError::from)?;
            }
            selection.set_quantity(quantity);
            selection.submit(cart).await?;
        }
        CartAction::Set { line_id, quantity } => {
            let line_id = known_line(&cart.snapshot(), line_id)?;
            cart.update_quantity(&line_id, quantity).await?;
        }
        CartAction::Remove { line_id } => {
            let line_id = known_line(&cart.snapshot(), line_id)?;
            cart.remove_line(&line_id).await?;
        }
        CartAction::Watch => return watch(storefront).await,
    }

    print_cart(&cart.snapshot(), storefront);
    Ok(())
}

/// Follow realtime changes and reprint on every snapshot change.
async fn watch<G: Gateway>(storefront: &Storefront<G>) -> Result<(), CliError> {
    let cart = storefront.cart();
    let _realtime = cart.watch_realtime();
    let mut updates = cart.subscribe();

    loop {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.phase != CartPhase::Fetching {
            print_cart(&snapshot, storefront);
        }
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn known_line(snapshot: &CartSnapshot, line_id: String) -> Result<CartLineId, CliError> {
    let id = CartLineId::new(line_id);
    if snapshot.line(&id).is_none() {
        return Err(CliError::UnknownLine(id.into_inner()));
    }
    Ok(id)
}

#[allow(clippy::print_stdout)]
fn print_cart<G: Gateway>(snapshot: &CartSnapshot, storefront: &Storefront<G>) {
    let currency: &CurrencyPreference = storefront.currency();
    if let Some(error) = &snapshot.error {
        println!("! {error}");
    }
    if snapshot.slow {
        println!("! The cart is taking longer than usual to load.");
    }
    if snapshot.is_empty() {
        println!("Your cart is empty.");
        return;
    }

    for line in &snapshot.lines {
        let options: Vec<&str> = [line.selected_size.as_deref(), line.selected_color.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        println!(
            "{}  {:<28} {:<10} x{:<3} {:>14}",
            line.id,
            line.product.name,
            options.join("/"),
            line.quantity,
            currency.format(line.subtotal())
        );
    }

    let totals = snapshot.totals(storefront.cart().shipping_fee());
    println!("{:>60}", format!("Subtotal {}", currency.format(totals.subtotal)));
    println!("{:>60}", format!("Shipping {}", currency.format(totals.shipping)));
    println!("{:>60}", format!("Total {}", currency.format(totals.total)));
}
