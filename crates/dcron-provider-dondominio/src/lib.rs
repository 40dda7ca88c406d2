// # DonDominio DNS Provider
//
// Pushes A record updates through the DonDNS dynamic DNS endpoint.
//
// ## Behavior
//
// - One GET per update, no retries: the next watcher tick is the retry
// - Any HTTP answer counts as accepted; the body is logged either way
// - Network failures are logged and reported as `Ok(false)`
// - Outside production no request is made and `Ok(false)` is returned
//
// ## Security Requirements
//
// - The API key travels only in the request query string
// - The API key NEVER appears in logs, including reqwest error messages
//   (which embed the request URL)
//
// ## API Reference
//
// ```http
// GET https://dondns.dondominio.com/json/?user=<user>&password=<api_key>&host=<host>&ip=<ip>
// ```

use async_trait::async_trait;
use dcron_core::config::{DnsProviderKind, Environment};
use dcron_core::traits::{DnsProvider, UpdateOptions};
use dcron_core::{Error, ProviderRegistry, Result};
use std::sync::Arc;
use std::time::Duration;

/// DonDNS API base URL
pub const DONDOMINIO_API_BASE: &str = "https://dondns.dondominio.com";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// DonDominio dynamic DNS provider
///
/// The provider itself holds no credentials: user and API key come with
/// each record's [`UpdateOptions`].
///
/// # Dry-Run Mode
///
/// A provider that is not live logs the update it would make and returns
/// `Ok(false)` without touching the network.
#[derive(Debug, Clone)]
pub struct DondominioProvider {
    /// Endpoint base, overridable for tests
    base_url: String,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Whether requests are actually sent
    live: bool,
}

impl DondominioProvider {
    /// Create a provider against the production endpoint
    pub fn new(live: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self {
            base_url: DONDOMINIO_API_BASE.to_string(),
            client,
            live,
        }
    }

    /// Create a provider whose liveness follows the environment
    pub fn for_environment(environment: Environment) -> Self {
        Self::new(environment.is_production())
    }

    /// Send requests to another endpoint base
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn update_url(&self) -> String {
        format!("{}/json/", self.base_url)
    }
}

#[async_trait]
impl DnsProvider for DondominioProvider {
    async fn update(&self, options: &UpdateOptions) -> Result<bool> {
        if options.provider != DnsProviderKind::Dondominio {
            return Err(Error::provider(
                "dondominio",
                format!("record {} belongs to provider {}", options.host, options.provider),
            ));
        }

        if !self.live {
            tracing::info!(
                "[DRY-RUN] Would point {} at {} via DonDominio",
                options.host,
                options.ip
            );
            return Ok(false);
        }

        tracing::info!("Updating DonDominio record: {} -> {}", options.host, options.ip);

        let ip = options.ip.to_string();
        let response = self
            .client
            .get(self.update_url())
            .query(&[
                ("user", options.user.as_str()),
                ("password", options.api_key.as_str()),
                ("host", options.host.as_str()),
                ("ip", ip.as_str()),
            ])
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read response body".to_string());
                tracing::info!(
                    "DonDominio answered {} for {}: {}",
                    status,
                    options.host,
                    body.trim()
                );
                Ok(true)
            }
            Err(e) => {
                // The URL carries the API key
                tracing::error!(
                    "DonDominio update of {} failed: {}",
                    options.host,
                    e.without_url()
                );
                Ok(false)
            }
        }
    }

    fn kind(&self) -> DnsProviderKind {
        DnsProviderKind::Dondominio
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Register the DonDominio provider with a registry
///
/// Requests are only sent in the production environment.
///
/// # Example
///
/// ```rust
/// use dcron_core::ProviderRegistry;
/// use dcron_core::config::Environment;
///
/// let mut registry = ProviderRegistry::new();
/// dcron_provider_dondominio::register(&mut registry, Environment::Development);
/// ```
pub fn register(registry: &mut ProviderRegistry, environment: Environment) {
    let provider = DondominioProvider::for_environment(environment);
    if !provider.is_live() {
        tracing::warn!("DonDominio provider running in DRY-RUN mode ({:?}), no changes will be made", environment);
    }
    registry.register_provider(Arc::new(provider));
}
