//! Urban Threads CLI - drive the storefront from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Format a base-currency amount
//! ut-cli price 1990 USD
//!
//! # Browse the catalog
//! ut-cli products list --category tops --sort price-low
//! ut-cli products search denim
//!
//! # Work with the cart (needs STOREFRONT_EMAIL / STOREFRONT_PASSWORD)
//! ut-cli cart add <product-id> --quantity 2 --size M --color Black
//! ut-cli cart watch
//!
//! # Place an order
//! ut-cli checkout --full-name "Somchai Jaidee" --phone 0812345678 ...
//! ```
//!
//! # Commands
//!
//! - `price` - Format an amount in a display currency
//! - `currency` - Read or change the saved display currency
//! - `products` - List, search and show catalog products
//! - `cart` - Show and change the signed-in shopper's cart
//! - `checkout` - Turn the cart into an order
//! - `orders` - Show order history

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use urban_threads_storefront::Storefront;
use urban_threads_storefront::config::StorefrontConfig;
use urban_threads_storefront::gateway::SupabaseClient;
use urban_threads_storefront::telemetry;

mod commands;

use commands::CliError;

const SESSION_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const SESSION_REFRESH_MARGIN_SECS: i64 = 120;

#[derive(Parser)]
#[command(name = "ut-cli")]
#[command(author, version, about = "Urban Threads storefront CLI")]
struct Cli {
    /// Shopper email for commands that need a signed-in session
    #[arg(long, global = true, env = "STOREFRONT_EMAIL")]
    email: Option<String>,

    /// Shopper password
    #[arg(long, global = true, env = "STOREFRONT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a base-currency (THB) amount in another currency
    Price {
        /// Amount in base units
        amount: i64,
        /// Target currency code; unknown codes fall back to THB
        #[arg(default_value = "THB")]
        currency: String,
    },
    /// Read or change the saved display currency
    Currency {
        #[command(subcommand)]
        action: commands::currency::CurrencyAction,
    },
    /// Browse the catalog
    Products {
        #[command(subcommand)]
        action: commands::catalog::ProductsAction,
    },
    /// Show and change the cart
    Cart {
        #[command(subcommand)]
        action: commands::cart::CartAction,
    },
    /// Place an order for everything in the cart
    Checkout(commands::checkout::CheckoutArgs),
    /// Show placed orders
    Orders,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        #[allow(clippy::print_stderr)]
        {
            eprintln!("error: {e}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Commands::Price { amount, currency } = &cli.command {
        commands::currency::price(*amount, currency);
        return Ok(());
    }

    let config = StorefrontConfig::from_env()?;
    let _telemetry = telemetry::init(&config);
    let storefront = Storefront::connect(&config).await;

    match cli.command {
        Commands::Price { .. } => {}
        Commands::Currency { action } => commands::currency::run(&storefront, action).await?,
        Commands::Products { action } => commands::catalog::run(&storefront, action).await?,
        Commands::Cart { action } => {
            sign_in(&storefront, cli.email, cli.password).await?;
            let keep_alive = matches!(action, commands::cart::CartAction::Watch)
                .then(|| tokio::spawn(keep_session_alive(storefront.clone())));
            let result = commands::cart::run(&storefront, action).await;
            if let Some(task) = keep_alive {
                task.abort();
            }
            result?;
        }
        Commands::Checkout(args) => {
            sign_in(&storefront, cli.email, cli.password).await?;
            commands::checkout::run(&storefront, args).await?;
        }
        Commands::Orders => {
            sign_in(&storefront, cli.email, cli.password).await?;
            commands::checkout::orders(&storefront).await?;
        }
    }
    Ok(())
}

/// Refresh the access token shortly before it expires, for long-running
/// commands. Stops once the session can no longer be refreshed.
async fn keep_session_alive(storefront: Storefront<SupabaseClient>) {
    let mut interval = tokio::time::interval(SESSION_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = storefront
            .refresh_session(chrono::Duration::seconds(SESSION_REFRESH_MARGIN_SECS))
            .await
        {
            tracing::warn!(error = %e, "Session refresh failed");
            if storefront.session().current_user().is_none() {
                return;
            }
        }
    }
}

async fn sign_in(
    storefront: &Storefront<SupabaseClient>,
    email: Option<String>,
    password: Option<String>,
) -> Result<(), CliError> {
    let (Some(email), Some(password)) = (email, password) else {
        return Err(CliError::MissingCredentials);
    };
    storefront
        .sign_in_with_password(&email, &SecretString::from(password))
        .await?;
    Ok(())
}
