//! Component wiring for the daemon and the one-shot commands
//!
//! Everything here only assembles `dcron-core` pieces; the behavior lives
//! in the core library.

use anyhow::{Context, Result};
use dcron_core::config::{
    BACKUPS_JOB, BackupSettings, CronConfig, DEFAULT_BACKUP_JOB_EXPRESSION,
    DEFAULT_IP_JOB_EXPRESSION, DNS_JOB, Environment, WatcherSettings,
};
use dcron_core::cron::{CronRegistry, CronSync, SyncReport, parse_timezone, task_fn};
use dcron_core::{
    BackupScheduler, BackupSummary, ConfigStore, Error, FileStateStore, IpWatcher, ProcessRunner,
    ProviderRegistry, RunOptions, TokioProcessRunner, WatchEvent,
};
use dcron_ip_http::{HttpIpSource, HttpsPropagationVerifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Config;

/// Time allowed for in-flight jobs to finish after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct App {
    config: Config,
    config_store: ConfigStore,
    runner: Arc<dyn ProcessRunner>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let config_store = ConfigStore::new(config.root.clone());
        Self {
            config,
            config_store,
            runner: Arc::new(TokioProcessRunner::new()),
        }
    }

    fn provider_registry(&self) -> ProviderRegistry {
        provider_registry(self.config.environment)
    }

    async fn watcher(&self) -> Result<(IpWatcher, mpsc::Receiver<WatchEvent>)> {
        let state_path = self.config_store.state_path();
        let state_store = FileStateStore::new(&state_path)
            .await
            .with_context(|| format!("Failed to open state file {}", state_path.display()))?;

        let settings = WatcherSettings {
            verify_host: self.config.verify_host.clone(),
            verify_path: self.config.verify_path.clone(),
            ..WatcherSettings::default()
        };

        Ok(IpWatcher::new(
            Arc::new(HttpIpSource::with_override(self.config.ip_source_url.clone())),
            Arc::new(HttpsPropagationVerifier::new()),
            Arc::new(self.provider_registry()),
            Arc::new(state_store),
            self.config_store.clone(),
            settings,
        ))
    }

    fn backup_scheduler(&self, deploy_id: &str) -> BackupScheduler {
        let settings = BackupSettings {
            verify_export_exit_code: self.config.verify_export_exit_code,
            ..BackupSettings::default()
        };
        BackupScheduler::new(
            deploy_id,
            self.config_store.clone(),
            self.runner.clone(),
            settings,
        )
    }

    /// One IP check over `deploy_ids`
    ///
    /// Returns `false` when any deploy reported a failure.
    pub async fn run_dns(&self, deploy_ids: &[String]) -> Result<bool> {
        let (watcher, mut events) = self.watcher().await?;
        watcher.check(deploy_ids).await;
        drop(watcher);

        let mut healthy = true;
        while let Some(event) = events.recv().await {
            debug!("Watch event: {:?}", event);
            if matches!(
                event,
                WatchEvent::ConfigError { .. }
                    | WatchEvent::ResolveFailed { .. }
                    | WatchEvent::VerificationFailed { .. }
            ) {
                healthy = false;
            }
        }
        Ok(healthy)
    }

    /// One backup pass per deploy
    ///
    /// Returns `false` when any target failed.
    pub async fn run_backups(&self, deploy_ids: &[String], force: bool) -> Result<bool> {
        let mut healthy = true;
        for deploy_id in deploy_ids {
            let summary = self
                .backup_scheduler(deploy_id)
                .run(RunOptions { force })
                .await;
            log_summary(deploy_id, &summary);
            healthy &= summary.failed() == 0;
        }
        Ok(healthy)
    }

    /// Install the deploy's jobs into the user crontab
    pub async fn sync(&self, deploy_id: &str) -> Result<SyncReport> {
        let binary = std::env::current_exe().context("Failed to locate the dcrond binary")?;
        let sync = CronSync::new(self.runner.clone(), self.config_store.clone(), binary);
        Ok(sync.sync(deploy_id).await?)
    }

    /// Schedule both jobs and run until a shutdown signal
    pub async fn daemon(&self, deploy_ids: Vec<String>) -> Result<()> {
        let timezone = parse_timezone(self.config.time_zone.as_deref())?;
        let shutdown = CancellationToken::new();
        let mut registry = CronRegistry::new(timezone, shutdown.clone());

        // Job expressions come from the first deploy
        let cron_config = self.job_overrides(&deploy_ids[0]).await;

        let (watcher, events) = self.watcher().await?;
        if let Some(expression) = job_schedule(&cron_config, DNS_JOB, DEFAULT_IP_JOB_EXPRESSION) {
            let watcher = Arc::new(watcher);
            let dns_ids = deploy_ids.clone();
            registry.add(
                DNS_JOB,
                &expression,
                task_fn(move || {
                    let watcher = watcher.clone();
                    let ids = dns_ids.clone();
                    async move { watcher.check(&ids).await }
                }),
            );
        }

        if let Some(expression) = job_schedule(&cron_config, BACKUPS_JOB, DEFAULT_BACKUP_JOB_EXPRESSION) {
            let schedulers: Arc<Vec<BackupScheduler>> = Arc::new(
                deploy_ids
                    .iter()
                    .map(|id| self.backup_scheduler(id))
                    .collect(),
            );
            registry.add(
                BACKUPS_JOB,
                &expression,
                task_fn(move || {
                    let schedulers = schedulers.clone();
                    async move { run_all_backups(&schedulers).await }
                }),
            );
        }

        let report = registry.init();
        info!(
            "Scheduled {} job(s) in {} for {}",
            report.started.len(),
            timezone,
            deploy_ids.join(",")
        );
        for rejected in &report.rejected {
            warn!("Job {} stays dormant", rejected.name);
        }

        let event_log = tokio::spawn(log_events(events, shutdown.clone()));

        // Shares the scheduled job's overlap guard
        if registry.run_now(BACKUPS_JOB) {
            info!("Running startup backup pass");
        } else {
            warn!("Backups job is not scheduled, skipping the startup backup pass");
        }

        let signal = wait_for_shutdown().await?;
        info!("Received shutdown signal: {}", signal);

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, registry.shutdown()).await;
        event_log.abort();

        match drained {
            Ok(()) => {
                info!("Shutting down daemon");
                Ok(())
            }
            Err(_) => anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT),
        }
    }

    /// Cron document whose `jobs` section sets the daemon's schedules
    ///
    /// A missing or unreadable document means default schedules.
    async fn job_overrides(&self, deploy_id: &str) -> CronConfig {
        match self.config_store.load_cron_config(deploy_id).await {
            Ok(config) => config,
            Err(Error::NotFound(what)) => {
                debug!("No cron config for {} ({}), using default schedules", deploy_id, what);
                CronConfig::default()
            }
            Err(e) => {
                error!("Cannot read job schedules of {}, using defaults: {}", deploy_id, e);
                CronConfig::default()
            }
        }
    }
}

/// Expression of a daemon job; `None` leaves the job unscheduled
fn job_schedule(config: &CronConfig, job: &str, default: &str) -> Option<String> {
    match config.job_expression(job, default) {
        Ok(expression) => Some(expression),
        Err(e) => {
            error!("Job {} stays dormant: {}", job, e);
            None
        }
    }
}

/// Registry with every compiled-in DNS provider
pub fn provider_registry(environment: Environment) -> ProviderRegistry {
    #[allow(unused_mut)]
    let mut registry = ProviderRegistry::new();

    #[cfg(feature = "dondominio")]
    {
        info!("Registering DonDominio provider");
        dcron_provider_dondominio::register(&mut registry, environment);
    }

    #[cfg(not(feature = "dondominio"))]
    warn!(
        "No DNS provider compiled in ({:?}), DNS records cannot be updated",
        environment
    );

    registry
}

async fn run_all_backups(schedulers: &[BackupScheduler]) {
    for scheduler in schedulers {
        let summary = scheduler.run_once().await;
        log_summary(scheduler.deploy_id(), &summary);
    }
}

fn log_summary(deploy_id: &str, summary: &BackupSummary) {
    if summary.failed() > 0 {
        warn!(
            "Backups for {}: {} created, {} not due, {} failed",
            deploy_id,
            summary.created(),
            summary.not_due(),
            summary.failed()
        );
    } else {
        info!(
            "Backups for {}: {} created, {} not due",
            deploy_id,
            summary.created(),
            summary.not_due()
        );
    }
}

async fn log_events(mut events: mpsc::Receiver<WatchEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => debug!("Watch event: {:?}", event),
                None => break,
            },
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
