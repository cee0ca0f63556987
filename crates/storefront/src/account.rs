//! Profile, address book and order history for the signed-in shopper.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use urban_threads_core::{AddressId, ContactError, Phone, ShippingAddress, UserId};

use crate::error::Result;
use crate::gateway::{
    Embed, Filter, Gateway, GatewayError, Mutation, RowQuery, SortOrder, decode_row, decode_rows,
};
use crate::models::{Address, NewAddress, Order, Profile};
use crate::selection::SelectionError;
use crate::session::SessionContext;

const PROFILES_TABLE: &str = "profiles";
const ADDRESSES_TABLE: &str = "addresses";
const ORDERS_TABLE: &str = "orders";

/// Account reads and writes, always scoped to the session's user.
pub struct Account<G> {
    gateway: Arc<G>,
    session: SessionContext,
}

impl<G> Clone for Account<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            session: self.session.clone(),
        }
    }
}

impl<G: Gateway> Account<G> {
    #[must_use]
    pub const fn new(gateway: Arc<G>, session: SessionContext) -> Self {
        Self { gateway, session }
    }

    /// The shopper's profile, created empty on first access.
    ///
    /// If the new profile cannot be saved it is still returned, unsaved.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    #[instrument(skip(self))]
    pub async fn profile(&self) -> Result<Profile> {
        let user = self.require_user()?;
        let query = RowQuery::table(PROFILES_TABLE).filter(Filter::eq("id", user.as_str()));
        let mut rows = decode_rows::<Profile>(self.gateway.query(&query).await?)?;
        if !rows.is_empty() {
            return Ok(rows.swap_remove(0));
        }

        let now = Utc::now();
        let profile = Profile {
            id: user,
            full_name: None,
            phone: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        let row = serde_json::to_value(&profile).map_err(GatewayError::from)?;
        let insert = Mutation::insert(PROFILES_TABLE, row);
        match self.gateway.mutate(&insert).await {
            Ok(rows) => Ok(decode_row(rows, "profile")?),
            Err(e) => {
                warn!(error = %e, "Could not create profile, using an unsaved one");
                Ok(profile)
            }
        }
    }

    /// Change the shopper's name and phone.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a name under two characters or a
    /// malformed phone number, or the gateway's error.
    #[instrument(skip(self, full_name, phone))]
    pub async fn update_profile(&self, full_name: &str, phone: Option<&str>) -> Result<Profile> {
        let user = self.require_user()?;
        let full_name = full_name.trim();
        if full_name.chars().count() < 2 {
            return Err(ContactError::TooShort {
                field: "full name",
                min: 2,
            }
            .into());
        }
        let phone = match phone.map(str::trim).filter(|p| !p.is_empty()) {
            Some(phone) => Some(Phone::parse(phone)?.as_str().to_owned()),
            None => None,
        };

        let now = Utc::now();
        let update = Mutation::update(
            PROFILES_TABLE,
            json!({ "full_name": full_name, "phone": phone, "updated_at": now }),
        )
        .filter(Filter::eq("id", user.as_str()));
        let updated = self.gateway.mutate(&update).await?;
        if !updated.is_empty() {
            info!(user_id = %user, "Profile updated");
            return Ok(decode_row(updated, "profile")?);
        }

        let insert = Mutation::insert(
            PROFILES_TABLE,
            json!({
                "id": user.as_str(),
                "full_name": full_name,
                "phone": phone,
                "created_at": now,
                "updated_at": now,
            }),
        );
        info!(user_id = %user, "Profile created");
        Ok(decode_row(self.gateway.mutate(&insert).await?, "profile")?)
    }

    /// Saved addresses, default first.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    pub async fn addresses(&self) -> Result<Vec<Address>> {
        let user = self.require_user()?;
        let query = RowQuery::table(ADDRESSES_TABLE)
            .filter(Filter::eq("user_id", user.as_str()))
            .order(SortOrder::desc("is_default"));
        Ok(decode_rows(self.gateway.query(&query).await?)?)
    }

    /// The default address, if one is set.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    pub async fn default_address(&self) -> Result<Option<Address>> {
        let user = self.require_user()?;
        let query = RowQuery::table(ADDRESSES_TABLE)
            .filter(Filter::eq("user_id", user.as_str()))
            .filter(Filter::eq("is_default", true))
            .limit(1);
        let rows = decode_rows::<Address>(self.gateway.query(&query).await?)?;
        Ok(rows.into_iter().next())
    }

    /// Save an address. The first address saved becomes the default.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    #[instrument(skip(self, address))]
    pub async fn add_address(
        &self,
        address: ShippingAddress,
        make_default: bool,
    ) -> Result<Address> {
        let user = self.require_user()?;
        let is_default = make_default || self.default_address().await?.is_none();
        if is_default {
            self.clear_default(&user, None).await?;
        }

        let new = NewAddress {
            user_id: user,
            address,
            is_default,
        };
        let row = serde_json::to_value(&new).map_err(GatewayError::from)?;
        let insert = Mutation::insert(ADDRESSES_TABLE, row);
        let saved: Address = decode_row(self.gateway.mutate(&insert).await?, "address")?;
        info!(address_id = %saved.id, is_default, "Address saved");
        Ok(saved)
    }

    /// Make `id` the only default address.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the shopper has no such address.
    #[instrument(skip(self, id), fields(address_id = %id))]
    pub async fn set_default_address(&self, id: &AddressId) -> Result<Address> {
        let user = self.require_user()?;
        let update = Mutation::update(ADDRESSES_TABLE, json!({ "is_default": true }))
            .filter(Filter::eq("id", id.as_str()))
            .filter(Filter::eq("user_id", user.as_str()));
        let address: Address =
            decode_row(self.gateway.mutate(&update).await?, &format!("address {id}"))?;
        self.clear_default(&user, Some(id)).await?;
        Ok(address)
    }

    /// Delete a saved address.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    #[instrument(skip(self, id), fields(address_id = %id))]
    pub async fn delete_address(&self, id: &AddressId) -> Result<()> {
        let user = self.require_user()?;
        let delete = Mutation::delete(ADDRESSES_TABLE)
            .filter(Filter::eq("id", id.as_str()))
            .filter(Filter::eq("user_id", user.as_str()));
        self.gateway.mutate(&delete).await?;
        Ok(())
    }

    /// Placed orders with their lines, newest first.
    ///
    /// # Errors
    ///
    /// Returns a validation error when signed out, or the gateway's error.
    #[instrument(skip(self))]
    pub async fn orders(&self) -> Result<Vec<Order>> {
        let user = self.require_user()?;
        let query = RowQuery::table(ORDERS_TABLE)
            .embed(Embed::many("order_items", "order_id", &[]))
            .filter(Filter::eq("user_id", user.as_str()))
            .order(SortOrder::desc("created_at"));
        Ok(decode_rows(self.gateway.query(&query).await?)?)
    }

    /// Unset the default flag on every address except `keep`.
    async fn clear_default(&self, user: &UserId, keep: Option<&AddressId>) -> Result<()> {
        let mut update = Mutation::update(ADDRESSES_TABLE, json!({ "is_default": false }))
            .filter(Filter::eq("user_id", user.as_str()))
            .filter(Filter::eq("is_default", true));
        if let Some(keep) = keep {
            update = update.filter(Filter::neq("id", keep.as_str()));
        }
        self.gateway.mutate(&update).await?;
        Ok(())
    }

    fn require_user(&self) -> Result<UserId> {
        self.session
            .user_id()
            .ok_or_else(|| SelectionError::NotSignedIn.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::error::StorefrontError;
    use crate::gateway::memory::InMemoryBackend;
    use crate::session::CurrentUser;

    fn account() -> (Arc<InMemoryBackend>, Account<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let session = SessionContext::signed_in(CurrentUser {
            id: UserId::new("u-1"),
            email: Some("buyer@example.com".to_owned()),
        });
        (Arc::clone(&backend), Account::new(backend, session))
    }

    fn address(name: &str) -> ShippingAddress {
        ShippingAddress::parse(
            name,
            "0812345678",
            "99 Sukhumvit Road",
            None,
            "Watthana",
            "Bangkok",
            "10110",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_profile_created_on_first_access() {
        let (backend, account) = account();
        let profile = account.profile().await.unwrap();
        assert_eq!(profile.id, UserId::new("u-1"));
        assert_eq!(backend.rows("profiles").len(), 1);

        account.profile().await.unwrap();
        assert_eq!(backend.rows("profiles").len(), 1);
    }

    #[tokio::test]
    async fn test_update_profile_validates() {
        let (_backend, account) = account();
        let err = account.update_profile("A", None).await.unwrap_err();
        assert!(matches!(err, StorefrontError::Validation(_)));

        let profile = account
            .update_profile("Somchai Jaidee", Some("081-234-5678"))
            .await
            .unwrap();
        assert_eq!(profile.full_name.as_deref(), Some("Somchai Jaidee"));
        assert_eq!(profile.phone.as_deref(), Some("081-234-5678"));
    }

    #[tokio::test]
    async fn test_first_address_becomes_default() {
        let (_backend, account) = account();
        let first = account.add_address(address("Home"), false).await.unwrap();
        assert!(first.is_default);

        let second = account.add_address(address("Office"), false).await.unwrap();
        assert!(!second.is_default);

        account.set_default_address(&second.id).await.unwrap();
        let addresses = account.addresses().await.unwrap();
        assert_eq!(addresses[0].id, second.id);
        assert_eq!(addresses.iter().filter(|a| a.is_default).count(), 1);
        assert_eq!(account.default_address().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_delete_address() {
        let (backend, account) = account();
        let saved = account.add_address(address("Home"), true).await.unwrap();
        account.delete_address(&saved.id).await.unwrap();
        assert!(backend.rows("addresses").is_empty());
        assert!(account.default_address().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signed_out_is_refused() {
        let (backend, account) = account();
        account.session.sign_out();
        assert!(account.orders().await.is_err());
        assert_eq!(backend.query_count(), 0);
    }
}
