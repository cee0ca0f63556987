//! Signed-in shopper, shared by every controller that needs an identity.
//!
//! One [`SessionContext`] is created at startup and cloned into the cart
//! controller, checkout and account services. Sign-in and sign-out go through
//! it, so each consumer sees the same user. An expired session is
//! distinguished from a deliberate sign-out so the caller can send the
//! shopper back to sign in.

use std::sync::Arc;

use tokio::sync::watch;
use urban_threads_core::UserId;

use crate::error::{clear_sentry_user, set_sentry_user};

/// Identity of the signed-in shopper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub email: Option<String>,
}

/// Authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    SignedOut,
    SignedIn(CurrentUser),
    /// The backend rejected the session; sign in again.
    Expired,
}

/// Shared handle to the session. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct SessionContext {
    status: Arc<watch::Sender<SessionStatus>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// A signed-out session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: Arc::new(watch::Sender::new(SessionStatus::SignedOut)),
        }
    }

    /// A session already signed in as `user`.
    #[must_use]
    pub fn signed_in(user: CurrentUser) -> Self {
        let session = Self::new();
        session.sign_in(user);
        session
    }

    pub fn sign_in(&self, user: CurrentUser) {
        set_sentry_user(&user.id, user.email.as_deref());
        tracing::info!(user_id = %user.id, "Signed in");
        self.status.send_replace(SessionStatus::SignedIn(user));
    }

    pub fn sign_out(&self) {
        clear_sentry_user();
        tracing::info!("Signed out");
        self.status.send_replace(SessionStatus::SignedOut);
    }

    /// Mark the session as rejected by the backend.
    pub fn expire(&self) {
        let was_signed_in = self
            .status
            .send_if_modified(|status| match status {
                SessionStatus::SignedIn(_) => {
                    *status = SessionStatus::Expired;
                    true
                }
                _ => false,
            });
        if was_signed_in {
            clear_sentry_user();
            tracing::warn!("Session expired");
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn current_user(&self) -> Option<CurrentUser> {
        match &*self.status.borrow() {
            SessionStatus::SignedIn(user) => Some(user.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.current_user().map(|user| user.id)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(*self.status.borrow(), SessionStatus::SignedIn(_))
    }

    /// Watch for sign-in, sign-out and expiry.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}
