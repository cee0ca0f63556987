//! Checkout and order history.
//!
//! # Usage
//!
//! ```bash
//! # Fields left out are filled from the saved default address or profile
//! ut-cli checkout --address-line-1 "99 Sukhumvit Road" --city Watthana \
//!     --province Bangkok --postal-code 10110 --payment-method mobile_banking
//!
//! ut-cli orders
//! ```

use clap::Args;
use urban_threads_storefront::Storefront;
use urban_threads_storefront::gateway::Gateway;

use super::CliError;

#[derive(Args)]
pub struct CheckoutArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    address_line_1: Option<String>,
    #[arg(long)]
    address_line_2: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    province: Option<String>,
    #[arg(long)]
    postal_code: Option<String>,
    /// `credit_card` or `mobile_banking`
    #[arg(long)]
    payment_method: Option<String>,
}

pub async fn run<G: Gateway>(storefront: &Storefront<G>, args: CheckoutArgs) -> Result<(), CliError> {
    let checkout = storefront.checkout();
    let mut form = checkout.prefill().await?;

    let overrides = [
        (&mut form.email, args.email),
        (&mut form.full_name, args.full_name),
        (&mut form.phone, args.phone),
        (&mut form.address_line_1, args.address_line_1),
        (&mut form.address_line_2, args.address_line_2),
        (&mut form.city, args.city),
        (&mut form.province, args.province),
        (&mut form.postal_code, args.postal_code),
        (&mut form.payment_method, args.payment_method),
    ];
    for (field, value) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }

    let order = checkout.place_order(&form).await?;
    let currency = storefront.currency();

    #[allow(clippy::print_stdout)]
    {
        println!("Order {} placed.", order.id);
        println!(
            "{} line(s), total {} ({})",
            order.lines.len(),
            currency.format(order.total_amount),
            order.payment_method
        );
    }
    Ok(())
}

pub async fn orders<G: Gateway>(storefront: &Storefront<G>) -> Result<(), CliError> {
    let orders = storefront.account().orders().await?;
    let currency = storefront.currency();

    #[allow(clippy::print_stdout)]
    {
        if orders.is_empty() {
            println!("No orders yet.");
        }
        for order in orders {
            let placed = order
                .created_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!(
                "{}  {placed:<16} {:<16} {:>14}  {} line(s)",
                order.id,
                format!("{:?}", order.status),
                currency.format(order.total_amount),
                order.lines.len()
            );
        }
    }
    Ok(())
}
