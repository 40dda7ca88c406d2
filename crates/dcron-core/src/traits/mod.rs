//! Core traits for dcron
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`IpSource`]: Resolve the node's public IP
//! - [`DnsProvider`]: Push A record updates to a provider API
//! - [`StateStore`]: Persistent key/value state (last known IP, DNS marker)
//! - [`ProcessRunner`]: Run external commands
//! - [`ConnectivityProbe`] / [`PropagationVerifier`]: Network reachability checks

pub mod ip_source;
pub mod dns_provider;
pub mod state_store;
pub mod process_runner;
pub mod probe;

pub use ip_source::{IpSource, IpVersion};
pub use dns_provider::{DnsProvider, UpdateOptions};
pub use state_store::{StateStore, StateEntry};
pub use process_runner::{CommandSpec, ProcessOutput, ProcessRunner};
pub use probe::{ConnectivityProbe, PropagationVerifier};
