//! Connectivity probe based on a DNS lookup

use async_trait::async_trait;
use std::time::Duration;

use crate::traits::probe::ConnectivityProbe;

/// Domain resolved to decide whether the node is online
pub const DEFAULT_PROBE_DOMAIN: &str = "google.com";

/// Reports the node online when a well-known name resolves
#[derive(Debug, Clone)]
pub struct DnsLookupProbe {
    domain: String,
    timeout: Duration,
}

impl DnsLookupProbe {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for DnsLookupProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_DOMAIN)
    }
}

#[async_trait]
impl ConnectivityProbe for DnsLookupProbe {
    async fn is_online(&self) -> bool {
        let target = format!("{}:443", self.domain);
        match tokio::time::timeout(self.timeout, tokio::net::lookup_host(target)).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                tracing::debug!("Lookup of {} failed: {}", self.domain, e);
                false
            }
            Err(_) => {
                tracing::debug!("Lookup of {} timed out", self.domain);
                false
            }
        }
    }
}
