// # DNS Provider Trait
//
// Defines the interface for pushing A record updates to a provider API.
//
// ## Implementations
//
// - DonDominio: `dcron-provider-dondominio` crate

use async_trait::async_trait;
use std::net::Ipv4Addr;

use crate::config::{DnsProviderKind, DnsRecordConfig};

/// Everything a provider needs for one record update
#[derive(Clone)]
pub struct UpdateOptions {
    /// Account user
    pub user: String,
    /// API key
    /// ⚠️ NEVER log this value
    pub api_key: String,
    /// Record host
    pub host: String,
    /// Provider the record belongs to
    pub provider: DnsProviderKind,
    /// New address
    pub ip: Ipv4Addr,
}

impl UpdateOptions {
    /// Build update options for a configured record
    pub fn for_record(record: &DnsRecordConfig, ip: Ipv4Addr) -> Self {
        Self {
            user: record.user.clone(),
            api_key: record.api_key.clone(),
            host: record.host.clone(),
            provider: record.provider,
            ip,
        }
    }
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for UpdateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOptions")
            .field("user", &self.user)
            .field("api_key", &"<REDACTED>")
            .field("host", &self.host)
            .field("provider", &self.provider)
            .field("ip", &self.ip)
            .finish()
    }
}

/// Trait for DNS provider implementations
///
/// # Contract
///
/// - One API call per invocation, no retries, no background tasks.
///   The next scheduled tick is the retry policy and it belongs to the watcher.
/// - Network and provider failures are logged and reported as `Ok(false)`.
///   `Err` is reserved for misuse (e.g. a record for another provider).
/// - Outside production the provider must not touch the network and
///   returns `Ok(false)`.
/// - The API key never appears in logs.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Point `options.host` at `options.ip`
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The provider answered
    /// - `Ok(false)`: Dry-run, or the call failed (already logged)
    /// - `Err(Error)`: The options cannot be handled by this provider
    async fn update(&self, options: &UpdateOptions) -> Result<bool, crate::Error>;

    /// Which provider this is
    fn kind(&self) -> DnsProviderKind;

    /// Whether calls reach the network
    fn is_live(&self) -> bool;
}
