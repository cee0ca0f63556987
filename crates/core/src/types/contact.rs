//! Contact and shipping details collected at checkout.
//!
//! These values are copied into the order at placement time, so an order
//! keeps the address it shipped to even if the customer edits their address
//! book afterwards.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced when validating contact or address fields.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContactError {
    /// The email address is malformed.
    #[error("invalid email address")]
    InvalidEmail,
    /// The phone number is too short or contains invalid characters.
    #[error("phone number must have at least {min} digits")]
    InvalidPhone {
        /// Minimum accepted length.
        min: usize,
    },
    /// A free-text field is shorter than its minimum.
    #[error("{field} must be at least {min} characters")]
    TooShort {
        /// Field name as shown to the user.
        field: &'static str,
        /// Minimum accepted length.
        min: usize,
    },
    /// The postal code is not exactly five digits.
    #[error("postal code must be exactly 5 digits")]
    InvalidPostalCode,
}

/// An email address with minimal structural validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    /// Maximum length of an email address (RFC 5321).
    pub const MAX_LENGTH: usize = 254;

    /// Parse an email address.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::InvalidEmail`] if the input is empty, too
    /// long, or lacks a non-empty local part and a dotted domain.
    pub fn parse(s: &str) -> Result<Self, ContactError> {
        let s = s.trim();
        if s.is_empty() || s.len() > Self::MAX_LENGTH {
            return Err(ContactError::InvalidEmail);
        }
        let (local, domain) = s.split_once('@').ok_or(ContactError::InvalidEmail)?;
        if local.is_empty() || domain.contains('@') || !domain.contains('.') {
            return Err(ContactError::InvalidEmail);
        }
        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(ContactError::InvalidEmail);
        }
        Ok(Self(s.to_owned()))
    }

    /// Returns the email address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A phone number as entered by the customer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Phone(String);

impl Phone {
    /// Minimum number of characters accepted.
    pub const MIN_LENGTH: usize = 9;

    /// Parse a phone number.
    ///
    /// Digits, spaces, dashes and a leading `+` are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::InvalidPhone`] for short or malformed input.
    pub fn parse(s: &str) -> Result<Self, ContactError> {
        let s = s.trim();
        let invalid = ContactError::InvalidPhone {
            min: Self::MIN_LENGTH,
        };
        let body = s.strip_prefix('+').unwrap_or(s);
        if !body
            .chars()
            .all(|c| c.is_ascii_digit() || c == ' ' || c == '-')
        {
            return Err(invalid);
        }
        if body.chars().filter(char::is_ascii_digit).count() < Self::MIN_LENGTH {
            return Err(invalid);
        }
        Ok(Self(s.to_owned()))
    }

    /// Returns the phone number as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A five-digit Thai postal code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PostalCode(String);

impl PostalCode {
    /// Parse a postal code.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::InvalidPostalCode`] unless the input is
    /// exactly five ASCII digits.
    pub fn parse(s: &str) -> Result<Self, ContactError> {
        let s = s.trim();
        if s.len() == 5 && s.chars().all(|c| c.is_ascii_digit()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(ContactError::InvalidPostalCode)
        }
    }

    /// Returns the postal code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Immutable shipping address snapshot stored on an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShippingAddress {
    pub full_name: String,
    pub phone: Phone,
    pub address_line_1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line_2: Option<String>,
    pub city: String,
    pub province: String,
    pub postal_code: PostalCode,
}

impl ShippingAddress {
    /// Validate raw form input into an address.
    ///
    /// # Errors
    ///
    /// Returns the first failing field's [`ContactError`].
    pub fn parse(
        full_name: &str,
        phone: &str,
        address_line_1: &str,
        address_line_2: Option<&str>,
        city: &str,
        province: &str,
        postal_code: &str,
    ) -> Result<Self, ContactError> {
        Ok(Self {
            full_name: min_chars(full_name, "full name", 2)?,
            phone: Phone::parse(phone)?,
            address_line_1: min_chars(address_line_1, "address", 5)?,
            address_line_2: address_line_2
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            city: min_chars(city, "city", 2)?,
            province: min_chars(province, "province", 2)?,
            postal_code: PostalCode::parse(postal_code)?,
        })
    }
}

fn min_chars(value: &str, field: &'static str, min: usize) -> Result<String, ContactError> {
    let value = value.trim();
    if value.chars().count() < min {
        return Err(ContactError::TooShort { field, min });
    }
    Ok(value.to_owned())
}
