//! Provider registry
//!
//! Maps each [`DnsProviderKind`] to the provider instance that serves it,
//! so the watcher dispatches on a typed key instead of a string lookup.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dcron_core::ProviderRegistry;
//!
//! let mut registry = ProviderRegistry::new();
//! dcron_provider_dondominio::register(&mut registry, environment);
//!
//! // Fail at startup if a deploy references a provider nobody registered
//! registry.validate_records(&cron_config.dns_records()?)?;
//! ```
//!
//! The registry is filled once during startup, then shared read-only
//! behind an `Arc`.

use crate::config::{DnsProviderKind, DnsRecordConfig};
use crate::error::{Error, Result};
use crate::traits::DnsProvider;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of DNS providers by kind
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<DnsProviderKind, Arc<dyn DnsProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own kind
    ///
    /// Registering the same kind twice replaces the earlier provider.
    pub fn register_provider(&mut self, provider: Arc<dyn DnsProvider>) {
        let kind = provider.kind();
        if self.providers.insert(kind, provider).is_some() {
            tracing::warn!("DNS provider {} registered twice, keeping the latest", kind);
        }
    }

    /// Look up the provider for a kind
    pub fn provider(&self, kind: DnsProviderKind) -> Result<Arc<dyn DnsProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::config(format!("DNS provider '{}' is not registered", kind)))
    }

    /// Check that every record has a registered provider
    pub fn validate_records(&self, records: &[DnsRecordConfig]) -> Result<()> {
        for record in records {
            if !self.has_provider(record.provider) {
                return Err(Error::config(format!(
                    "Record {} uses DNS provider '{}', which is not registered",
                    record.host, record.provider
                )));
            }
        }
        Ok(())
    }

    /// Check if a provider kind is registered
    pub fn has_provider(&self, kind: DnsProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// List all registered provider kinds
    pub fn list_providers(&self) -> Vec<DnsProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
