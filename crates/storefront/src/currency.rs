//! Persisted display-currency preference.
//!
//! The choice lives in a small JSON document under
//! [`STORAGE_KEY`], read once at startup and rewritten on every change.
//! A missing file, unreadable document or unsupported code all fall back to
//! the base currency; price display never waits on the preference.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use urban_threads_core::{BaseAmount, CurrencyCode};

/// Key the selected code is stored under.
pub const STORAGE_KEY: &str = "urban-threads-selected-currency";

/// Errors saving the preference.
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("Failed to write preferences: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode preferences: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The shopper's display currency. Cheaply cloneable; clones share state.
#[derive(Debug, Clone)]
pub struct CurrencyPreference {
    path: Arc<PathBuf>,
    selected: Arc<watch::Sender<CurrencyCode>>,
    stored: Arc<watch::Sender<bool>>,
}

impl CurrencyPreference {
    /// Read the preference stored at `path`.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stored = read_stored(&path).await;
        let selected = stored.unwrap_or(CurrencyCode::BASE);
        debug!(currency = %selected, path = %path.display(), "Currency preference loaded");

        Self {
            path: Arc::new(path),
            selected: Arc::new(watch::Sender::new(selected)),
            stored: Arc::new(watch::Sender::new(stored.is_some())),
        }
    }

    #[must_use]
    pub fn selected(&self) -> CurrencyCode {
        *self.selected.borrow()
    }

    /// Change the display currency and persist it.
    ///
    /// The in-memory choice changes even if writing fails.
    ///
    /// # Errors
    ///
    /// Returns [`PreferenceError`] if the file cannot be written.
    pub async fn set(&self, currency: CurrencyCode) -> Result<(), PreferenceError> {
        self.selected.send_replace(currency);
        self.persist(currency).await?;
        self.stored.send_replace(true);
        Ok(())
    }

    /// Adopt a detected default, unless the shopper has already chosen.
    ///
    /// Unsupported codes are ignored. Returns whether the suggestion applied.
    pub fn suggest(&self, code: &str) -> bool {
        if *self.stored.borrow() {
            return false;
        }
        match CurrencyCode::parse(code) {
            Some(currency) => {
                self.selected.send_replace(currency);
                true
            }
            None => false,
        }
    }

    /// Format a base amount in the selected currency.
    #[must_use]
    pub fn format(&self, amount: BaseAmount) -> String {
        self.selected().format(amount)
    }

    /// Watch for changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CurrencyCode> {
        self.selected.subscribe()
    }

    async fn persist(&self, currency: CurrencyCode) -> Result<(), PreferenceError> {
        let mut document = match tokio::fs::read(self.path.as_path()).await {
            Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes).unwrap_or_default(),
            Err(_) => Map::new(),
        };
        document.insert(
            STORAGE_KEY.to_owned(),
            Value::String(currency.code().to_owned()),
        );

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(self.path.as_path(), serde_json::to_vec_pretty(&document)?).await?;
        debug!(currency = %currency, "Currency preference saved");
        Ok(())
    }
}

async fn read_stored(path: &Path) -> Option<CurrencyCode> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let document: Map<String, Value> = match serde_json::from_slice(&bytes) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Ignoring unreadable preferences file");
            return None;
        }
    };
    let code = document.get(STORAGE_KEY)?.as_str()?;
    let parsed = CurrencyCode::parse(code);
    if parsed.is_none() {
        warn!(code, "Ignoring unsupported stored currency");
    }
    parsed
}
