// # dcrond - deployment cron daemon
//
// Thin integration layer: reads configuration, initializes the runtime,
// registers providers and hands control to `dcron-core`. No DNS, backup or
// scheduling logic lives here.
//
// ## Commands
//
// - `dcrond daemon [--deploy-id <ids>]`: schedule the IP check and backup
//   jobs and run until SIGTERM/SIGINT
// - `dcrond backups <ids> [--force]`: one backup pass
// - `dcrond dns <ids>`: one IP check
// - `dcrond sync <id>`: install the deploy's jobs into the user crontab
// - `dcrond run <job> <ids>`: run one job once (what crontab lines call)
//
// `<ids>` is a comma-separated list of deploy ids.
//
// ## Configuration
//
// Environment variables:
//
// - `DCRON_ROOT`: workspace holding `engine-private/` (default: cwd)
// - `NODE_ENV`: `production` enables live DNS updates
// - `TIME_ZONE`: schedule timezone (default: America/New_York)
// - `DEFAULT_DEPLOY_ID`: deploy ids for `daemon` when `--deploy-id` is absent
// - `DEFAULT_DEPLOY_HOST`, `DEFAULT_DEPLOY_PATH`: propagation check target
// - `DCRON_IP_SOURCE_URL`: IP lookup service tried first
// - `DCRON_VERIFY_EXPORT_EXIT_CODE`: drop snapshots whose export failed
// - `DCRON_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```bash
// export DCRON_ROOT=/home/dd/engine
// export NODE_ENV=production
// export DEFAULT_DEPLOY_HOST=www.example.com
//
// dcrond daemon --deploy-id dd-core
// ```

mod app;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dcron_core::config::{Environment, KNOWN_JOBS};
use dcron_core::config_store::split_deploy_list;
use dcron_core::cron::parse_timezone;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use crate::app::App;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DcronExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<DcronExitCode> for ExitCode {
    fn from(code: DcronExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Comma-separated deploy id list
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeployIds(Vec<String>);

fn parse_deploy_ids(value: &str) -> std::result::Result<DeployIds, String> {
    let ids = split_deploy_list(value);
    if ids.is_empty() {
        return Err("expected at least one deploy id".to_string());
    }
    Ok(DeployIds(ids))
}

#[derive(Debug, Parser)]
#[command(name = "dcrond", version, about = "Deployment cron daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Schedule the IP check and backup jobs until a shutdown signal
    Daemon {
        /// Deploy ids served by this node
        #[arg(long, env = "DEFAULT_DEPLOY_ID", value_parser = parse_deploy_ids)]
        deploy_id: Option<DeployIds>,
    },
    /// Run one backup pass
    Backups {
        #[arg(value_parser = parse_deploy_ids)]
        deploy_ids: DeployIds,
        /// Take a snapshot even when none is due
        #[arg(long)]
        force: bool,
    },
    /// Run one IP check
    Dns {
        #[arg(value_parser = parse_deploy_ids)]
        deploy_ids: DeployIds,
    },
    /// Install the deploy's jobs into the user crontab
    Sync { deploy_id: String },
    /// Run one job once
    Run {
        #[arg(value_parser = clap::builder::PossibleValuesParser::new(KNOWN_JOBS))]
        job: String,
        #[arg(value_parser = parse_deploy_ids)]
        deploy_ids: DeployIds,
    },
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub environment: Environment,
    pub time_zone: Option<String>,
    pub verify_host: Option<String>,
    pub verify_path: String,
    pub ip_source_url: Option<String>,
    pub verify_export_exit_code: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let root = match env::var("DCRON_ROOT") {
            Ok(root) if !root.trim().is_empty() => PathBuf::from(root),
            _ => env::current_dir()?,
        };

        Ok(Self {
            root,
            environment: Environment::parse(&env::var("NODE_ENV").unwrap_or_default()),
            time_zone: non_empty_var("TIME_ZONE"),
            verify_host: non_empty_var("DEFAULT_DEPLOY_HOST"),
            verify_path: env::var("DEFAULT_DEPLOY_PATH").unwrap_or_default(),
            ip_source_url: non_empty_var("DCRON_IP_SOURCE_URL"),
            verify_export_exit_code: match non_empty_var("DCRON_VERIFY_EXPORT_EXIT_CODE") {
                Some(value) => parse_flag(&value).ok_or_else(|| {
                    anyhow::anyhow!(
                        "DCRON_VERIFY_EXPORT_EXIT_CODE must be true or false. Got: {}",
                        value
                    )
                })?,
                None => false,
            },
            log_level: env::var("DCRON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Defaults for a workspace root, ignoring the environment
    #[cfg(test)]
    fn for_root(root: &std::path::Path) -> Self {
        Self {
            root: root.to_path_buf(),
            environment: Environment::Test,
            time_zone: None,
            verify_host: None,
            verify_path: String::new(),
            ip_source_url: None,
            verify_export_exit_code: false,
            log_level: "info".to_string(),
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!(
                "DCRON_ROOT is not a directory: {}",
                self.root.display()
            );
        }

        parse_timezone(self.time_zone.as_deref())
            .map_err(|e| anyhow::anyhow!("TIME_ZONE is not valid: {}", e))?;

        if let Some(ref host) = self.verify_host
            && (host.contains('/') || host.contains(char::is_whitespace))
        {
            anyhow::bail!(
                "DEFAULT_DEPLOY_HOST must be a bare host name. Got: {}",
                host
            );
        }

        if !self.verify_path.is_empty() && !self.verify_path.starts_with('/') {
            anyhow::bail!(
                "DEFAULT_DEPLOY_PATH must start with '/'. Got: {}",
                self.verify_path
            );
        }

        if let Some(ref url) = self.ip_source_url
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            anyhow::bail!(
                "DCRON_IP_SOURCE_URL must use HTTP or HTTPS scheme. Got: {}",
                url
            );
        }

        self.tracing_level()?;

        Ok(())
    }

    fn tracing_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            _ => anyhow::bail!(
                "DCRON_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                DcronExitCode::ConfigError.into()
            } else {
                DcronExitCode::CleanShutdown.into()
            };
        }
    };

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return DcronExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return DcronExitCode::ConfigError.into();
    }

    let log_level = config.tracing_level().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return DcronExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return DcronExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run(cli.command, config)).into()
}

async fn run(command: Command, config: Config) -> DcronExitCode {
    info!(
        "dcrond starting (root={}, environment={:?})",
        config.root.display(),
        config.environment
    );
    let app = App::new(config);

    let result = match command {
        Command::Daemon { deploy_id } => {
            let Some(DeployIds(ids)) = deploy_id else {
                error!("No deploy id: pass --deploy-id or set DEFAULT_DEPLOY_ID");
                return DcronExitCode::ConfigError;
            };
            app.daemon(ids).await.map(|()| true)
        }
        Command::Backups { deploy_ids, force } => app.run_backups(&deploy_ids.0, force).await,
        Command::Dns { deploy_ids } => app.run_dns(&deploy_ids.0).await,
        Command::Sync { deploy_id } => app.sync(&deploy_id).await.map(|report| {
            info!(
                "Crontab for {}: {} job(s), {}",
                deploy_id,
                report.lines.len(),
                if report.changed { "updated" } else { "unchanged" }
            );
            true
        }),
        Command::Run { job, deploy_ids } => run_job(&app, &job, &deploy_ids.0).await,
    };

    match result {
        Ok(true) => DcronExitCode::CleanShutdown,
        Ok(false) => DcronExitCode::RuntimeError,
        Err(e) => {
            error!("dcrond error: {:#}", e);
            DcronExitCode::RuntimeError
        }
    }
}

async fn run_job(app: &App, job: &str, deploy_ids: &[String]) -> Result<bool> {
    match job {
        dcron_core::config::DNS_JOB => app.run_dns(deploy_ids).await,
        dcron_core::config::BACKUPS_JOB => app.run_backups(deploy_ids, false).await,
        other => anyhow::bail!("Unknown job: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_deploy_lists() {
        let cli = Cli::try_parse_from(["dcrond", "backups", "dd-a, dd-b", "--force"]).unwrap();
        match cli.command {
            Command::Backups { deploy_ids, force } => {
                assert_eq!(deploy_ids.0, vec!["dd-a".to_string(), "dd-b".to_string()]);
                assert!(force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_job() {
        assert!(Cli::try_parse_from(["dcrond", "run", "cleanup", "dd-a"]).is_err());
        assert!(Cli::try_parse_from(["dcrond", "run", "dns", "dd-a"]).is_ok());
    }

    #[test]
    fn test_cli_rejects_empty_deploy_list() {
        assert!(Cli::try_parse_from(["dcrond", "dns", " , "]).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::for_root(dir.path()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let base = Config::for_root(dir.path());

        let config = Config {
            time_zone: Some("Mars/Olympus".to_string()),
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            verify_path: "health".to_string(),
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ip_source_url: Some("ftp://ip.example.com".to_string()),
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            log_level: "loud".to_string(),
            ..base.clone()
        };
        assert!(config.validate().is_err());

        let config = Config {
            root: dir.path().join("missing"),
            ..base
        };
        assert!(config.validate().is_err());
    }
}
