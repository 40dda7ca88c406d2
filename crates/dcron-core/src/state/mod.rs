// # State Store Implementations
//
// This module provides implementations of the StateStore trait for
// different persistence strategies, plus typed accessors for the entries
// the watcher owns.

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use std::net::Ipv4Addr;

use crate::traits::state_store::{DNS_MARKER_KEY, DNS_MARKER_PAUSE, LAST_IP_KEY, StateStore};
use crate::Result;

/// Last verified public IP
///
/// An unparsable stored value is reported as unknown, which makes the next
/// tick push DNS again and overwrite it.
pub async fn last_known_ip(store: &dyn StateStore) -> Result<Option<Ipv4Addr>> {
    match store.get_value(LAST_IP_KEY).await? {
        Some(value) => match value.parse::<Ipv4Addr>() {
            Ok(ip) => Ok(Some(ip)),
            Err(_) => {
                tracing::warn!("Ignoring invalid stored IP '{}'", value);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Record a verified public IP
pub async fn set_last_known_ip(store: &dyn StateStore, ip: Ipv4Addr) -> Result<()> {
    store.set(LAST_IP_KEY, &ip.to_string()).await
}

/// Whether a DNS update is in flight or failed verification
pub async fn dns_in_flux(store: &dyn StateStore) -> Result<bool> {
    Ok(store.get_value(DNS_MARKER_KEY).await?.as_deref() == Some(DNS_MARKER_PAUSE))
}

/// Raise the "DNS in flux" marker
pub async fn mark_dns_in_flux(store: &dyn StateStore) -> Result<()> {
    store.set(DNS_MARKER_KEY, DNS_MARKER_PAUSE).await
}

/// Clear the "DNS in flux" marker
pub async fn clear_dns_in_flux(store: &dyn StateStore) -> Result<()> {
    store.delete(DNS_MARKER_KEY).await
}
