// # Network probes
//
// Two small capabilities the watcher uses around a DNS update:
//
// - [`ConnectivityProbe`]: is this node online at all? Checked first so an
//   offline host never concludes that its IP changed.
// - [`PropagationVerifier`]: which address answers for a host right now?
//   Used after a provider update to confirm the change took effect.

use async_trait::async_trait;
use std::net::IpAddr;

/// Internet reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `true` when the node can resolve public names
    async fn is_online(&self) -> bool;
}

/// Live propagation check
#[async_trait]
pub trait PropagationVerifier: Send + Sync {
    /// Request `https://{host}{path}` and return the remote address of the
    /// socket that answered
    async fn remote_addr(&self, host: &str, path: &str) -> Result<IpAddr, crate::Error>;
}
