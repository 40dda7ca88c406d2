// # IP Source Trait
//
// Defines the interface for resolving the node's current public IP.
//
// ## Implementations
//
// - HTTP-based: `dcron-ip-http` crate (ipify and friends)
//
// ## Usage
//
// ```rust,ignore
// use dcron_core::IpSource;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let source = /* IpSource implementation */;
//     let current_ip = source.current().await?;
//     println!("public ip: {}", current_ip);
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::net::IpAddr;

/// IP version (v4 or v6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Trait for public IP source implementations
///
/// The watcher calls [`IpSource::current`] once per deploy on every tick.
/// Sources are single-shot: no caching between calls, no background polling.
/// The scheduler owns timing, the watcher owns the retry decision.
#[async_trait]
pub trait IpSource: Send + Sync {
    /// Get the current public IP address
    ///
    /// # Returns
    ///
    /// - `Ok(IpAddr)`: The current IP address
    /// - `Err(Error)`: If unable to determine the current IP
    async fn current(&self) -> Result<IpAddr, crate::Error>;

    /// Get the IP version this source resolves
    ///
    /// Returns `None` if the implementation may return either version.
    fn version(&self) -> Option<IpVersion> {
        None
    }
}
