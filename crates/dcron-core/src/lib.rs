// # dcron-core
//
// Core library for deployment cron jobs: DNS self-healing and rolling
// database backups.
//
// ## Architecture Overview
//
// - **IpSource**: Resolves the node's public IP
// - **DnsProvider**: Pushes A record updates to a provider API
// - **StateStore**: Persists the last verified IP and the "DNS in flux" marker
// - **ProcessRunner**: Runs external commands (database exports, crontab)
// - **IpWatcher**: One DNS self-healing tick (probe → resolve → update → verify)
// - **BackupScheduler**: Frequency-gated, retention-bounded snapshots
// - **CronRegistry**: In-process scheduler of named jobs
// - **CronSync**: Mirrors job schedules into the OS crontab
// - **ProviderRegistry**: DNS providers keyed by kind
//
// ## Design Principles
//
// 1. **Library-First**: the daemon is a thin shell over this crate
// 2. **Capabilities as traits**: network, filesystem state and processes are
//    injected, so every component runs against doubles in tests
// 3. **Next tick is the retry**: no component retries in-process

pub mod backup;
pub mod config;
pub mod config_store;
pub mod cron;
pub mod error;
pub mod probe;
pub mod process;
pub mod registry;
pub mod state;
pub mod traits;
pub mod watcher;

// Re-export core types for convenience
pub use backup::{BackupScheduler, BackupSummary, RunOptions, TargetOutcome, TargetReport};
pub use config::{CronConfig, DnsProviderKind, Environment, ServerConfig};
pub use config_store::ConfigStore;
pub use cron::{CronExpr, CronRegistry, CronSync, CronTask};
pub use error::{Error, Result};
pub use probe::DnsLookupProbe;
pub use process::TokioProcessRunner;
pub use registry::ProviderRegistry;
pub use state::{FileStateStore, MemoryStateStore};
pub use traits::{ConnectivityProbe, DnsProvider, IpSource, ProcessRunner, PropagationVerifier, StateStore};
pub use watcher::{IpWatcher, WatchEvent};
