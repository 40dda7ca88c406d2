//! Rolling database backups
//!
//! A run walks every deploy group declared in the invoking deploy's
//! `backups` section and, for every `(host, path)` with a database,
//! maintains a set of snapshot directories:
//!
//! ```text
//! engine-private/cron-backups/example.com-api/
//! ├── 1736413200000/
//! ├── 1736499600000/
//! └── 1736586000000/     newest
//! ```
//!
//! Directory names are creation times in epoch milliseconds. Names that do
//! not parse are not snapshots and are left alone.
//!
//! Targets are visited in the order of `conf.server.json`. One target
//! failing, or one site entry that does not decode, never stops the run.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::config::{BackupPolicy, BackupSettings, DatabaseProvider};
use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::traits::{CommandSpec, ProcessRunner};

/// Options of a single run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Take a snapshot even when the newest one is inside the frequency window
    pub force: bool,
}

/// What happened to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// A snapshot directory was created and the export ran
    Created {
        snapshot: PathBuf,
        exit_code: Option<i32>,
    },
    /// The newest snapshot is recent enough
    NotDue { newest: i64 },
    /// The target could not be backed up
    Failed { error: String },
}

/// Result for one `(host, path)` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub deploy_id: String,
    pub host: String,
    pub path: String,
    pub outcome: TargetOutcome,
    /// Snapshot directories removed by retention
    pub pruned: Vec<PathBuf>,
}

/// Result of a run; callers may ignore it
#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub targets: Vec<TargetReport>,
}

impl BackupSummary {
    /// Targets that got a new snapshot
    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Created { .. }))
    }

    /// Targets skipped by the frequency gate
    pub fn not_due(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::NotDue { .. }))
    }

    /// Targets that failed
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| predicate(&t.outcome)).count()
    }
}

/// Backs up the databases of the deploy groups a deploy declares
pub struct BackupScheduler {
    deploy_id: String,
    config_store: ConfigStore,
    runner: Arc<dyn ProcessRunner>,
    settings: BackupSettings,
}

impl BackupScheduler {
    pub fn new(
        deploy_id: impl Into<String>,
        config_store: ConfigStore,
        runner: Arc<dyn ProcessRunner>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            deploy_id: deploy_id.into(),
            config_store,
            runner,
            settings,
        }
    }

    /// Deploy whose `backups` section drives this scheduler
    pub fn deploy_id(&self) -> &str {
        &self.deploy_id
    }

    /// Run once, honoring the frequency gate
    pub async fn run_once(&self) -> BackupSummary {
        self.run(RunOptions::default()).await
    }

    /// Run once with explicit options
    pub async fn run(&self, options: RunOptions) -> BackupSummary {
        let mut summary = BackupSummary::default();

        let config = match self.config_store.load_cron_config(&self.deploy_id).await {
            Ok(config) => config,
            Err(Error::NotFound(what)) => {
                debug!("{} not found, nothing to back up for {}", what, self.deploy_id);
                return summary;
            }
            Err(e) => {
                error!("Cannot load cron config of {}: {}", self.deploy_id, e);
                return summary;
            }
        };

        let groups = match config.backup_groups() {
            Ok(groups) if groups.is_empty() => {
                debug!("No backups section for {}", self.deploy_id);
                return summary;
            }
            Ok(groups) => groups,
            Err(e) => {
                error!("Cannot read backups of {}: {}", self.deploy_id, e);
                return summary;
            }
        };

        for group in &groups {
            let deploy_ids = match self.config_store.load_deploy_group(&group.deploy_group_id).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("Cannot resolve deploy group {}: {}", group.deploy_group_id, e);
                    continue;
                }
            };

            for deploy_id in &deploy_ids {
                self.backup_deploy(deploy_id, options, &mut summary).await;
            }
        }

        info!(
            "Backup run of {}: {} created, {} not due, {} failed",
            self.deploy_id,
            summary.created(),
            summary.not_due(),
            summary.failed()
        );
        summary
    }

    async fn backup_deploy(&self, deploy_id: &str, options: RunOptions, summary: &mut BackupSummary) {
        let server = match self.config_store.load_server_config(deploy_id).await {
            Ok(server) => server,
            Err(Error::NotFound(what)) => {
                debug!("{} not found, skipping {}", what, deploy_id);
                return;
            }
            Err(e) => {
                error!("Cannot load server config of {}: {}", deploy_id, e);
                return;
            }
        };

        for (host, paths) in &server {
            for (path, section) in paths {
                let site = match section.decode() {
                    Ok(Some(site)) => site,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Skipping {}{} of {}: invalid site entry: {}", host, path, deploy_id, e);
                        continue;
                    }
                };
                let Some(db) = &site.db else {
                    continue;
                };
                if site.single_replica {
                    debug!("{}{} is a single replica, skipping", host, path);
                    continue;
                }
                let Some(engine) = db.engine() else {
                    warn!(
                        "Skipping {}{} of {}: unknown database provider '{}'",
                        host, path, deploy_id, db.provider
                    );
                    continue;
                };
                if let Some(frequency) = site.unknown_frequency() {
                    warn!(
                        "Unknown backup frequency '{}' for {}{}, using daily",
                        frequency, host, path
                    );
                }

                let report = self
                    .backup_target(deploy_id, host, path, site.backup_policy(), engine, options)
                    .await;
                summary.targets.push(report);
            }
        }
    }

    async fn backup_target(
        &self,
        deploy_id: &str,
        host: &str,
        path: &str,
        policy: BackupPolicy,
        engine: DatabaseProvider,
        options: RunOptions,
    ) -> TargetReport {
        let mut report = TargetReport {
            deploy_id: deploy_id.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            outcome: TargetOutcome::Failed {
                error: String::new(),
            },
            pruned: Vec::new(),
        };

        let now_ms = Utc::now().timestamp_millis();
        match self.try_backup_target(&mut report, policy, engine, now_ms, options).await {
            Ok(outcome) => report.outcome = outcome,
            Err(e) => {
                error!("Backup of {}{} ({}) failed: {}", host, path, deploy_id, e);
                report.outcome = TargetOutcome::Failed { error: e.to_string() };
            }
        }
        report
    }

    async fn try_backup_target(
        &self,
        report: &mut TargetReport,
        policy: BackupPolicy,
        engine: DatabaseProvider,
        now_ms: i64,
        options: RunOptions,
    ) -> Result<TargetOutcome> {
        let dir = self.config_store.backup_dir(&report.host, &report.path);
        fs::create_dir_all(&dir).await?;

        let snapshots = list_snapshots(&dir).await?;
        let newest = snapshots.first().copied();
        let window_ms = policy.frequency.window().as_millis() as i64;
        let due = options.force || newest.is_none_or(|newest| now_ms - newest >= window_ms);

        // Leave room for the snapshot about to be taken
        let keep = if due {
            policy.max_retention.saturating_sub(1)
        } else {
            policy.max_retention
        };
        for stale in snapshots.iter().skip(keep) {
            let stale_dir = dir.join(stale.to_string());
            match fs::remove_dir_all(&stale_dir).await {
                Ok(()) => {
                    debug!("Pruned snapshot {}", stale_dir.display());
                    report.pruned.push(stale_dir);
                }
                Err(e) => warn!("Failed to prune snapshot {}: {}", stale_dir.display(), e),
            }
        }

        if !due {
            let newest = newest.unwrap_or_default();
            debug!(
                "Newest snapshot of {}{} ({}) is inside the {:?} window",
                report.host, report.path, newest, policy.frequency
            );
            return Ok(TargetOutcome::NotDue { newest });
        }

        let snapshot = create_snapshot_dir(&dir, now_ms, newest).await?;
        let command = self.export_command(report, engine, &snapshot);
        info!("Backing up {}{} ({}) into {}", report.host, report.path, report.deploy_id, snapshot.display());

        let failure = match self.runner.run(&command).await {
            Ok(output) if output.success() => {
                return Ok(TargetOutcome::Created {
                    snapshot,
                    exit_code: output.exit_code,
                });
            }
            Ok(output) => {
                let message = format!(
                    "export exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                (message, output.exit_code)
            }
            Err(e) => (e.to_string(), None),
        };

        let (message, exit_code) = failure;
        if self.settings.verify_export_exit_code {
            if let Err(e) = fs::remove_dir_all(&snapshot).await {
                warn!("Failed to remove failed snapshot {}: {}", snapshot.display(), e);
            }
            return Err(Error::process(message));
        }

        warn!("Export into {} reported a failure: {}", snapshot.display(), message);
        Ok(TargetOutcome::Created { snapshot, exit_code })
    }

    fn export_command(&self, report: &TargetReport, engine: DatabaseProvider, snapshot: &Path) -> CommandSpec {
        let template = &self.settings.export_command;
        let dest = snapshot.display().to_string();
        let provider = engine.as_str();
        let render = |arg: &str| {
            arg.replace("{host}", &report.host)
                .replace("{path}", &report.path)
                .replace("{deploy_id}", &report.deploy_id)
                .replace("{dest}", &dest)
                .replace("{provider}", provider)
        };

        let cwd = template
            .cwd
            .clone()
            .unwrap_or_else(|| self.config_store.root().to_path_buf());

        CommandSpec::new(render(&template.program))
            .args(template.args.iter().map(|arg| render(arg)))
            .current_dir(cwd)
    }
}

/// Snapshot timestamps in a backup directory, newest first
pub async fn list_snapshots(dir: &Path) -> Result<Vec<i64>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut snapshots = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(stamp) = entry.file_name().to_str().and_then(parse_snapshot_name) {
            snapshots.push(stamp);
        }
    }

    snapshots.sort_unstable_by(|a, b| b.cmp(a));
    Ok(snapshots)
}

fn parse_snapshot_name(name: &str) -> Option<i64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Create a snapshot directory named after a time strictly newer than
/// `newest`, bumping past any existing name
async fn create_snapshot_dir(dir: &Path, now_ms: i64, newest: Option<i64>) -> Result<PathBuf> {
    let mut stamp = match newest {
        Some(newest) if newest >= now_ms => next_stamp(newest)?,
        _ => now_ms,
    };

    loop {
        let candidate = dir.join(stamp.to_string());
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => stamp = next_stamp(stamp)?,
            Err(e) => return Err(e.into()),
        }
    }
}

fn next_stamp(stamp: i64) -> Result<i64> {
    stamp
        .checked_add(1)
        .ok_or_else(|| Error::invalid_input(format!("No snapshot name left after {}", stamp)))
}
