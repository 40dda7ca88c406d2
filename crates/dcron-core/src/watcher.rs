//! IP watcher
//!
//! One `check()` call is one tick of the DNS self-healing loop:
//!
//! ```text
//!  ConnectivityProbe ── offline ──► stop
//!         │
//!         ▼  per deploy id, in order
//!  ConfigStore (records.A) ──► IpSource ──► same as last known IP? ──► no-op
//!         │ changed
//!         ▼
//!  mark "DNS in flux" ──► DnsProvider::update (per record) ──► PropagationVerifier
//!         │
//!         ▼  every changed deploy verified
//!  persist last known IP + clear marker
//! ```
//!
//! ## Failure policy
//!
//! Nothing is retried inside a tick. A failed resolution, provider call or
//! verification leaves the last known IP untouched (and the marker raised
//! when an update was attempted), so the next scheduled tick tries again.
//! Errors are logged and published as [`WatchEvent`]s, never returned.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{DnsProviderKind, DnsRecordConfig, WatcherSettings};
use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::probe::DnsLookupProbe;
use crate::registry::ProviderRegistry;
use crate::state;
use crate::traits::{ConnectivityProbe, IpSource, IpVersion, PropagationVerifier, StateStore, UpdateOptions};

/// Progress of a tick, published for monitoring and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Connectivity probe failed, tick aborted
    Offline,

    /// Deploy configuration could not be used
    ConfigError { deploy_id: String, error: String },

    /// Public IP could not be resolved (or was not IPv4)
    ResolveFailed { deploy_id: String, error: String },

    /// Public IP matches the last verified one
    IpUnchanged { deploy_id: String, ip: Ipv4Addr },

    /// Public IP differs from the last verified one
    IpChangeDetected {
        deploy_id: String,
        previous: Option<Ipv4Addr>,
        current: Ipv4Addr,
    },

    /// A provider update was issued
    ProviderDispatched {
        deploy_id: String,
        host: String,
        provider: DnsProviderKind,
        accepted: bool,
    },

    /// The verification host answered from the new IP
    VerificationSucceeded { deploy_id: String, host: String, ip: Ipv4Addr },

    /// The verification host did not answer from the new IP
    VerificationFailed {
        deploy_id: String,
        host: String,
        expected: Ipv4Addr,
        actual: Option<IpAddr>,
    },

    /// The new IP was persisted and the marker cleared
    RecordPersisted { ip: Ipv4Addr },
}

/// Outcome of one deploy within a tick
enum DeployOutcome {
    /// Nothing to do (no config, no records, resolution failed)
    Skipped,
    /// IP unchanged
    Unchanged,
    /// DNS updated and verified
    Verified(Ipv4Addr),
    /// DNS update attempted, verification failed
    Failed,
}

/// Detects public IP changes and heals DNS
pub struct IpWatcher {
    ip_source: Arc<dyn IpSource>,
    probe: Arc<dyn ConnectivityProbe>,
    verifier: Arc<dyn PropagationVerifier>,
    registry: Arc<ProviderRegistry>,
    state_store: Arc<dyn StateStore>,
    config_store: ConfigStore,
    settings: WatcherSettings,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl IpWatcher {
    /// Create a watcher
    ///
    /// Connectivity is probed with a DNS lookup of `google.com` unless
    /// replaced with [`IpWatcher::with_probe`].
    ///
    /// # Returns
    ///
    /// A tuple of (watcher, event_receiver). Events are dropped with a
    /// warning when the receiver falls behind.
    pub fn new(
        ip_source: Arc<dyn IpSource>,
        verifier: Arc<dyn PropagationVerifier>,
        registry: Arc<ProviderRegistry>,
        state_store: Arc<dyn StateStore>,
        config_store: ConfigStore,
        settings: WatcherSettings,
    ) -> (Self, mpsc::Receiver<WatchEvent>) {
        if ip_source.version() == Some(IpVersion::V6) {
            warn!("IP source only reports IPv6, A records will never be updated");
        }
        let (tx, rx) = mpsc::channel(settings.event_channel_capacity.max(1));

        let watcher = Self {
            ip_source,
            probe: Arc::new(DnsLookupProbe::default()),
            verifier,
            registry,
            state_store,
            config_store,
            settings,
            event_tx: tx,
        };

        (watcher, rx)
    }

    /// Replace the connectivity probe
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run one tick over the given deploys
    pub async fn check(&self, deploy_ids: &[String]) {
        if !self.probe.is_online().await {
            info!("No internet connectivity, skipping IP check");
            self.emit_event(WatchEvent::Offline);
            return;
        }

        // Read once: every deploy of the tick compares against the same value
        let last_ip = match state::last_known_ip(self.state_store.as_ref()).await {
            Ok(ip) => ip,
            Err(e) => {
                error!("Failed to read last known IP: {}", e);
                return;
            }
        };

        let mut dispatched = HashSet::new();
        let mut verified = None;
        let mut failed = false;

        for deploy_id in deploy_ids {
            match self.check_deploy(deploy_id, last_ip, &mut dispatched).await {
                DeployOutcome::Skipped | DeployOutcome::Unchanged => {}
                DeployOutcome::Verified(ip) => verified = Some(ip),
                DeployOutcome::Failed => failed = true,
            }
        }

        match verified {
            Some(ip) if !failed => {
                if let Err(e) = self.persist(ip).await {
                    error!("Failed to persist verified IP {}: {}", ip, e);
                }
            }
            Some(ip) => {
                warn!(
                    "IP {} verified for some deploys only, keeping the previous record",
                    ip
                );
            }
            None => {}
        }
    }

    async fn check_deploy(
        &self,
        deploy_id: &str,
        last_ip: Option<Ipv4Addr>,
        dispatched: &mut HashSet<(DnsProviderKind, String, Ipv4Addr)>,
    ) -> DeployOutcome {
        let records = match self.load_records(deploy_id).await {
            Ok(Some(records)) => records,
            Ok(None) => return DeployOutcome::Skipped,
            Err(e) => {
                error!("Cannot check DNS of {}: {}", deploy_id, e);
                self.emit_event(WatchEvent::ConfigError {
                    deploy_id: deploy_id.to_string(),
                    error: e.to_string(),
                });
                return DeployOutcome::Skipped;
            }
        };

        let current = match self.resolve_ipv4().await {
            Ok(ip) => ip,
            Err(e) => {
                error!("Failed to resolve public IP for {}: {}", deploy_id, e);
                self.emit_event(WatchEvent::ResolveFailed {
                    deploy_id: deploy_id.to_string(),
                    error: e.to_string(),
                });
                return DeployOutcome::Skipped;
            }
        };

        if last_ip == Some(current) {
            debug!("Public IP of {} unchanged ({})", deploy_id, current);
            self.emit_event(WatchEvent::IpUnchanged {
                deploy_id: deploy_id.to_string(),
                ip: current,
            });
            return DeployOutcome::Unchanged;
        }

        info!(
            "Public IP change for {}: {} -> {}",
            deploy_id,
            last_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "none".to_string()),
            current
        );
        self.emit_event(WatchEvent::IpChangeDetected {
            deploy_id: deploy_id.to_string(),
            previous: last_ip,
            current,
        });

        if let Err(e) = state::mark_dns_in_flux(self.state_store.as_ref()).await {
            error!("Failed to raise DNS marker, not updating {}: {}", deploy_id, e);
            return DeployOutcome::Failed;
        }

        for record in &records {
            let key = (record.provider, record.host.clone(), current);
            if !dispatched.insert(key) {
                debug!("{} -> {} already sent to {} this tick", record.host, current, record.provider);
                continue;
            }

            let accepted = match self.registry.provider(record.provider) {
                Ok(provider) => {
                    let options = UpdateOptions::for_record(record, current);
                    match provider.update(&options).await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Provider {} rejected update of {}: {}", record.provider, record.host, e);
                            false
                        }
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    false
                }
            };

            self.emit_event(WatchEvent::ProviderDispatched {
                deploy_id: deploy_id.to_string(),
                host: record.host.clone(),
                provider: record.provider,
                accepted,
            });
        }

        self.verify(deploy_id, &records, current).await
    }

    /// Records of a deploy, `None` when there is nothing to manage
    async fn load_records(&self, deploy_id: &str) -> Result<Option<Vec<DnsRecordConfig>>> {
        let config = match self.config_store.load_cron_config(deploy_id).await {
            Ok(config) => config,
            Err(Error::NotFound(what)) => {
                debug!("{} not found, no DNS records for {}", what, deploy_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let records = config.dns_records()?;
        if records.is_empty() {
            debug!("No A records configured for {}", deploy_id);
            return Ok(None);
        }

        self.registry.validate_records(&records)?;
        Ok(Some(records))
    }

    async fn resolve_ipv4(&self) -> Result<Ipv4Addr> {
        match self.ip_source.current().await? {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => Ok(ip),
                None => Err(Error::ip_source(format!("Resolved address {} is not IPv4", ip))),
            },
        }
    }

    async fn verify(&self, deploy_id: &str, records: &[DnsRecordConfig], expected: Ipv4Addr) -> DeployOutcome {
        let host = match &self.settings.verify_host {
            Some(host) => host.clone(),
            None => match records.first() {
                Some(record) => record.host.clone(),
                None => return DeployOutcome::Failed,
            },
        };

        let actual = match self.verifier.remote_addr(&host, &self.settings.verify_path).await {
            Ok(addr) => Some(addr.to_canonical()),
            Err(e) => {
                warn!("Propagation check of {} failed: {}", host, e);
                None
            }
        };

        if actual == Some(IpAddr::V4(expected)) {
            info!("DNS of {} verified: {} answers from {}", deploy_id, host, expected);
            self.emit_event(WatchEvent::VerificationSucceeded {
                deploy_id: deploy_id.to_string(),
                host,
                ip: expected,
            });
            DeployOutcome::Verified(expected)
        } else {
            warn!(
                "DNS of {} not propagated yet: {} answers from {:?}, expected {}",
                deploy_id, host, actual, expected
            );
            self.emit_event(WatchEvent::VerificationFailed {
                deploy_id: deploy_id.to_string(),
                host,
                expected,
                actual,
            });
            DeployOutcome::Failed
        }
    }

    async fn persist(&self, ip: Ipv4Addr) -> Result<()> {
        state::set_last_known_ip(self.state_store.as_ref(), ip).await?;
        state::clear_dns_in_flux(self.state_store.as_ref()).await?;
        info!("Recorded verified public IP {}", ip);
        self.emit_event(WatchEvent::RecordPersisted { ip });
        Ok(())
    }

    fn emit_event(&self, event: WatchEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Watch event channel full, dropping event");
            }
            // Nobody is listening
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
