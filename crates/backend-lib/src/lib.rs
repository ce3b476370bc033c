// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core library for the chat relay WebSocket server.
//!
//! A message arrives on an identified connection, is persisted through the
//! [`storage::Storage`] gateway, and is then pushed to every live connection
//! of its recipients as found in the [`directory::IdentityDirectory`].

pub mod config;
pub mod connection;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod storage;
pub mod validation;
pub mod ws_router;

use crate::config::Settings;
use crate::delivery::DeliveryEngine;
use crate::directory::IdentityDirectory;
use crate::error::AppError;
use crate::lifecycle::{ConnectionManager, IdentityResolver, TrustClaimed};
use crate::storage::Storage;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState<S> {
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Storage backend
    pub storage: S,
    /// Identity → live connection
    pub directory: Arc<IdentityDirectory>,
    /// Persist-then-push pipeline
    pub engine: Arc<DeliveryEngine<S>>,
    /// Live connection registry
    pub connections: Arc<ConnectionManager<S>>,
}

impl<S: Storage + Clone + 'static> AppState<S> {
    /// Create a new application state that trusts claimed identities
    pub fn new(storage: S, settings: Settings) -> Result<Self, AppError> {
        let resolver = Arc::new(TrustClaimed::new(settings.limits.clone()));
        Self::with_resolver(storage, settings, resolver)
    }

    /// Create a new application state with a custom identity resolver
    pub fn with_resolver(
        storage: S,
        settings: Settings,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self, AppError> {
        settings.validate()?;

        let directory = Arc::new(IdentityDirectory::new());
        let engine = Arc::new(DeliveryEngine::new(
            storage.clone(),
            directory.clone(),
            &settings,
        ));
        let connections = Arc::new(ConnectionManager::new(engine.clone(), resolver, &settings));

        Ok(Self {
            settings: Arc::new(settings),
            storage,
            directory,
            engine,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_state_shares_one_directory() {
        let state = AppState::new(MemoryStorage::new(), Settings::default()).unwrap();
        assert!(Arc::ptr_eq(&state.directory, state.engine.directory()));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = Settings::default();
        settings.delivery.outbound_buffer = 0;
        assert!(AppState::new(MemoryStorage::new(), settings).is_err());
    }

    struct AllowList(Vec<&'static str>);

    impl IdentityResolver for AllowList {
        fn resolve(&self, claimed: &str) -> Result<String, AppError> {
            if self.0.contains(&claimed) {
                Ok(claimed.to_string())
            } else {
                Err(AppError::Forbidden(format!("{claimed} is not allowed")))
            }
        }
    }

    #[test]
    fn test_custom_resolver_gates_identification() {
        let state = AppState::with_resolver(
            MemoryStorage::new(),
            Settings::default(),
            Arc::new(AllowList(vec!["alice"])),
        )
        .unwrap();

        let mut mallory = state.connections.open();
        assert!(state.connections.identify(&mut mallory, "mallory").is_err());
        let mut alice = state.connections.open();
        assert!(state.connections.identify(&mut alice, "alice").is_ok());
        assert_eq!(state.directory.len(), 1);
    }
}
