//! Synchronization of a deploy's job schedules into the user crontab
//!
//! Each deploy owns one managed block:
//!
//! ```text
//! # BEGIN dcron dd-core
//! 0 1 * * * cd /srv/engine && /usr/local/bin/dcrond run backups dd-core
//! # END dcron dd-core
//! ```
//!
//! Lines outside the block are left untouched.

use std::path::PathBuf;
use std::sync::Arc;

use super::expr::CronExpr;
use crate::config::KNOWN_JOBS;
use crate::config_store::ConfigStore;
use crate::traits::{CommandSpec, ProcessRunner};
use crate::{Error, Result};

/// Outcome of a synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Lines written into the managed block
    pub lines: Vec<String>,
    /// Whether the crontab was reinstalled
    pub changed: bool,
}

/// Writes job schedules into the OS crontab
pub struct CronSync {
    runner: Arc<dyn ProcessRunner>,
    config_store: ConfigStore,
    binary: PathBuf,
}

impl CronSync {
    /// `binary` is the daemon executable the crontab lines invoke
    pub fn new(runner: Arc<dyn ProcessRunner>, config_store: ConfigStore, binary: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            config_store,
            binary: binary.into(),
        }
    }

    /// Replace the deploy's managed block with its current `jobs` section
    ///
    /// A deploy without a cron document ends up with an empty block.
    pub async fn sync(&self, deploy_id: &str) -> Result<SyncReport> {
        let jobs = match self.config_store.load_cron_config(deploy_id).await {
            Ok(config) => config.jobs()?,
            Err(Error::NotFound(what)) => {
                tracing::debug!("{} missing, clearing cron block of {}", what, deploy_id);
                Default::default()
            }
            Err(e) => return Err(e),
        };

        let mut lines = Vec::new();
        for (name, section) in &jobs {
            let job = match section.decode() {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Job '{}' of {} is invalid: {}", name, deploy_id, e);
                    continue;
                }
            };
            if !job.enabled {
                tracing::debug!("Job '{}' of {} is disabled", name, deploy_id);
                continue;
            }
            if !KNOWN_JOBS.contains(&name.as_str()) {
                tracing::warn!("Skipping unknown job '{}' of {}", name, deploy_id);
                continue;
            }
            let expr = match CronExpr::parse(&job.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    tracing::error!(
                        "Job '{}' of {} has invalid expression '{}': {}",
                        name,
                        deploy_id,
                        job.expression,
                        e
                    );
                    continue;
                }
            };
            lines.push(self.job_line(&expr, name, deploy_id));
        }

        let current = self.read_crontab().await?;
        let updated = render_crontab(&current, deploy_id, &lines);
        let changed = updated != current;

        if changed {
            self.install_crontab(&updated).await?;
            tracing::info!("Installed {} cron line(s) for {}", lines.len(), deploy_id);
        } else {
            tracing::debug!("Crontab already up to date for {}", deploy_id);
        }

        Ok(SyncReport { lines, changed })
    }

    fn job_line(&self, expr: &CronExpr, job: &str, deploy_id: &str) -> String {
        let command = format!(
            "cd {} && {} run {} {}",
            shell_quote(&self.config_store.root().display().to_string()),
            shell_quote(&self.binary.display().to_string()),
            job,
            shell_quote(deploy_id)
        );
        format!("{} {}", expr, escape_percent(&command))
    }

    async fn read_crontab(&self) -> Result<String> {
        let output = self.runner.run(&CommandSpec::new("crontab").arg("-l")).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            // "no crontab for <user>"
            tracing::debug!("crontab -l failed, assuming empty: {}", output.stderr.trim());
            Ok(String::new())
        }
    }

    async fn install_crontab(&self, content: &str) -> Result<()> {
        let output = self
            .runner
            .run(&CommandSpec::new("crontab").arg("-").stdin(content))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::process(format!(
                "crontab - exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

/// Replace (or append) the managed block of a deploy
///
/// An empty `lines` removes the block entirely.
pub fn render_crontab(current: &str, deploy_id: &str, lines: &[String]) -> String {
    let begin = format!("# BEGIN dcron {}", deploy_id);
    let end = format!("# END dcron {}", deploy_id);

    let mut kept = Vec::new();
    let mut in_block = false;
    for line in current.lines() {
        if line.trim() == begin {
            in_block = true;
            continue;
        }
        if in_block {
            if line.trim() == end {
                in_block = false;
            }
            continue;
        }
        kept.push(line);
    }

    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept.pop();
    }

    let mut out = String::new();
    for line in kept {
        out.push_str(line);
        out.push('\n');
    }

    if !lines.is_empty() {
        out.push_str(&begin);
        out.push('\n');
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&end);
        out.push('\n');
    }

    out
}

fn shell_quote(value: &str) -> String {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c));
    if safe && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// cron turns an unescaped `%` in the command field into a newline
fn escape_percent(command: &str) -> String {
    command.replace('%', r"\%")
}
