//! Display currency commands.
//!
//! # Usage
//!
//! ```bash
//! ut-cli price 1990 EUR
//! ut-cli currency get
//! ut-cli currency set USD
//! ```
//!
//! # Environment Variables
//!
//! - `STOREFRONT_PREFERENCES_PATH` - Where the choice is saved

use clap::Subcommand;
use urban_threads_core::{BaseAmount, CurrencyCode, format_price};
use urban_threads_storefront::Storefront;
use urban_threads_storefront::gateway::Gateway;

use super::CliError;

#[derive(Subcommand)]
pub enum CurrencyAction {
    /// Print the saved display currency
    Get,
    /// Save a new display currency
    Set {
        /// One of THB, USD, EUR, GBP, JPY, AUD
        code: String,
    },
}

/// Print `amount` (base units) formatted for `currency`.
pub fn price(amount: i64, currency: &str) {
    #[allow(clippy::print_stdout)]
    {
        println!("{}", format_price(BaseAmount::new(amount), currency));
    }
}

pub async fn run<G: Gateway>(
    storefront: &Storefront<G>,
    action: CurrencyAction,
) -> Result<(), CliError> {
    let preference = storefront.currency();
    match action {
        CurrencyAction::Get => {}
        CurrencyAction::Set { code } => {
            let currency: CurrencyCode = code
                .parse()
                .map_err(|_| CliError::UnknownCurrency(code.clone()))?;
            preference.set(currency).await?;
            tracing::info!(currency = %currency, "Display currency saved");
        }
    }

    #[allow(clippy::print_stdout)]
    {
        let selected = preference.selected();
        println!("{selected} ({})", selected.format(BaseAmount::new(1000)));
    }
    Ok(())
}
