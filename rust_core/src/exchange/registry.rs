//! Connector registry
//!
//! Maps exchange ids to concrete connector implementations, resolved once
//! at startup. Components hold the registry by reference; there is no
//! module-level mutable state.

use super::{binance::BinanceConnector, okx::OkxConnector, ExchangeConnector};
use crate::errors::ExchangeError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of venue connectors, keyed by exchange id.
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn ExchangeConnector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Create a registry with all built-in venue connectors
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BinanceConnector::new()));
        registry.register(Arc::new(OkxConnector::new()));
        info!(
            "ConnectorRegistry initialized with {} connectors",
            registry.connectors.len()
        );
        registry
    }

    /// Register a connector under its own exchange id
    pub fn register(&mut self, connector: Arc<dyn ExchangeConnector>) {
        self.connectors
            .insert(connector.exchange_id().to_string(), connector);
    }

    pub fn get(&self, exchange_id: &str) -> Option<Arc<dyn ExchangeConnector>> {
        self.connectors.get(exchange_id).cloned()
    }

    /// Get a connector, returning an error for unknown exchange ids
    pub fn get_required(
        &self,
        exchange_id: &str,
    ) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
        self.get(exchange_id)
            .ok_or_else(|| ExchangeError::UnknownExchange(exchange_id.to_string()))
    }

    pub fn exchange_ids(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub fn contains(&self, exchange_id: &str) -> bool {
        self.connectors.contains_key(exchange_id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
