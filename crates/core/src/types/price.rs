//! Base-currency amounts and display-currency formatting.
//!
//! Every price in the data store is an integer in the base currency (Thai
//! baht) scaled by 100. Display currencies are derived at render time by a
//! fixed conversion table and rendered with the number conventions of a
//! locale chosen per currency.
//!
//! ```
//! use urban_threads_core::{BaseAmount, format_price};
//!
//! let price = BaseAmount::new(123_450);
//! assert_eq!(format_price(price, "THB"), "฿1,234.5");
//! assert_eq!(format_price(price, "USD"), "$33.33");
//! assert_eq!(format_price(price, "JPY"), "￥5,308");
//! ```

use core::fmt;
use core::iter::Sum;
use core::ops::Add;
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// An amount in the base currency's smallest unit (baht x 100).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BaseAmount(i64);

impl BaseAmount {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw stored amount.
    #[must_use]
    pub const fn new(units: i64) -> Self {
        Self(units)
    }

    /// Get the raw stored amount.
    #[must_use]
    pub const fn units(self) -> i64 {
        self.0
    }

    /// Amount for `quantity` items at this unit price.
    #[must_use]
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(i64::from(quantity)))
    }

    /// The amount in major base-currency units (baht).
    #[must_use]
    pub fn to_major(self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// Format for display in the given currency.
    #[must_use]
    pub fn display_in(self, currency: CurrencyCode) -> String {
        currency.format(self)
    }
}

impl Add for BaseAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for BaseAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl From<i64> for BaseAmount {
    fn from(units: i64) -> Self {
        Self(units)
    }
}

/// Error returned when parsing a currency code outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported currency code: {0}")]
pub struct UnknownCurrency(pub String);

/// Display currencies supported by the storefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    /// Thai baht, the base currency.
    #[default]
    THB,
    USD,
    EUR,
    GBP,
    JPY,
    AUD,
}

impl CurrencyCode {
    /// The currency every stored amount is denominated in.
    pub const BASE: Self = Self::THB;

    /// All supported display currencies.
    pub const ALL: [Self; 6] = [
        Self::THB,
        Self::USD,
        Self::EUR,
        Self::GBP,
        Self::JPY,
        Self::AUD,
    ];

    /// ISO 4217 code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::THB => "THB",
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::JPY => "JPY",
            Self::AUD => "AUD",
        }
    }

    /// Parse a code, returning `None` for anything unsupported.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(code.trim()))
    }

    /// Parse a code, falling back to the base currency when unsupported.
    ///
    /// Price display must never block on a bad code.
    #[must_use]
    pub fn parse_or_base(code: &str) -> Self {
        Self::parse(code).unwrap_or(Self::BASE)
    }

    /// Units of this currency per one unit of the base currency.
    #[must_use]
    pub fn rate(self) -> Decimal {
        match self {
            Self::THB => Decimal::ONE,
            Self::USD => Decimal::new(27, 3),
            Self::EUR => Decimal::new(25, 3),
            Self::GBP => Decimal::new(21, 3),
            Self::JPY => Decimal::new(43, 1),
            Self::AUD => Decimal::new(40, 3),
        }
    }

    /// BCP 47 locale used to render this currency.
    #[must_use]
    pub const fn locale(self) -> &'static str {
        match self {
            Self::THB => "th-TH",
            Self::USD => "en-US",
            Self::EUR => "de-DE",
            Self::GBP => "en-GB",
            Self::JPY => "ja-JP",
            Self::AUD => "en-AU",
        }
    }

    /// Maximum fractional digits shown.
    #[must_use]
    pub const fn max_fraction_digits(self) -> u32 {
        match self {
            Self::JPY => 0,
            _ => 2,
        }
    }

    const fn style(self) -> NumberStyle {
        match self {
            Self::THB => NumberStyle::prefix("฿"),
            Self::USD | Self::AUD => NumberStyle::prefix("$"),
            Self::GBP => NumberStyle::prefix("£"),
            Self::JPY => NumberStyle::prefix("￥"),
            Self::EUR => NumberStyle {
                symbol: "\u{a0}€",
                symbol_first: false,
                group: '.',
                decimal: ',',
            },
        }
    }

    /// Convert a base amount and render it for display.
    ///
    /// Trailing fractional zeros are dropped, matching the storefront's
    /// "0 to 2 fraction digits" display rule.
    #[must_use]
    pub fn format(self, amount: BaseAmount) -> String {
        let converted = (amount.to_major() * self.rate())
            .round_dp_with_strategy(
                self.max_fraction_digits(),
                RoundingStrategy::MidpointAwayFromZero,
            )
            .normalize();

        let style = self.style();
        let digits = converted.abs().to_string();
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits.as_str(), ""));

        let mut number = group_digits(whole, style.group);
        if !fraction.is_empty() {
            number.push(style.decimal);
            number.push_str(fraction);
        }

        let sign = if converted.is_sign_negative() && !converted.is_zero() {
            "-"
        } else {
            ""
        };

        if style.symbol_first {
            format!("{sign}{}{number}", style.symbol)
        } else {
            format!("{sign}{number}{}", style.symbol)
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for CurrencyCode {
    type Err = UnknownCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownCurrency(s.to_owned()))
    }
}

/// Format a stored base amount in the target display currency.
///
/// Unknown codes render as the base currency.
#[must_use]
pub fn format_price(amount: BaseAmount, target_currency: &str) -> String {
    CurrencyCode::parse_or_base(target_currency).format(amount)
}

struct NumberStyle {
    symbol: &'static str,
    symbol_first: bool,
    group: char,
    decimal: char,
}

impl NumberStyle {
    const fn prefix(symbol: &'static str) -> Self {
        Self {
            symbol,
            symbol_first: true,
            group: ',',
            decimal: '.',
        }
    }
}

fn group_digits(whole: &str, separator: char) -> String {
    let len = whole.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}
