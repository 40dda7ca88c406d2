//! Configuration types for dcron
//!
//! Two families live here:
//! - the per-deploy JSON documents (`conf.cron.json`, `conf.server.json`)
//!   read through [`crate::ConfigStore`]
//! - the runtime settings the daemon assembles from the environment and
//!   hands to the watcher and the backup scheduler

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default scheduler timezone
pub const DEFAULT_TIME_ZONE: &str = "America/New_York";

/// Default IP check job expression (every minute)
pub const DEFAULT_IP_JOB_EXPRESSION: &str = "* * * * *";

/// Default backup job expression (daily at 01:00)
pub const DEFAULT_BACKUP_JOB_EXPRESSION: &str = "0 1 * * *";

/// Name of the IP check / DNS update job
pub const DNS_JOB: &str = "dns";

/// Name of the database backup job
pub const BACKUPS_JOB: &str = "backups";

/// Jobs the daemon knows how to run
pub const KNOWN_JOBS: [&str; 2] = [DNS_JOB, BACKUPS_JOB];

/// Default number of snapshots kept per target
pub const DEFAULT_MAX_RETENTION: usize = 5;

/// A JSON subtree decoded only when its consumer asks for it
///
/// A malformed section fails [`Section::decode`] and nothing else: the
/// watcher can reject `records` while backups still read `backups`.
pub struct Section<T> {
    raw: serde_json::Value,
    _type: PhantomData<fn() -> T>,
}

impl<T> Section<T> {
    /// Wrap an already parsed JSON value
    pub fn from_value(raw: serde_json::Value) -> Self {
        Self {
            raw,
            _type: PhantomData,
        }
    }

    /// Whether the section was written (and not `null`)
    pub fn is_present(&self) -> bool {
        !self.raw.is_null()
    }
}

impl<T: DeserializeOwned> Section<T> {
    /// Decode the section; `None` when it is absent
    pub fn decode(&self) -> std::result::Result<Option<T>, serde_json::Error> {
        if !self.is_present() {
            return Ok(None);
        }
        T::deserialize(&self.raw).map(Some)
    }
}

impl<T> Default for Section<T> {
    fn default() -> Self {
        Self::from_value(serde_json::Value::Null)
    }
}

impl<T> Clone for Section<T> {
    fn clone(&self) -> Self {
        Self::from_value(self.raw.clone())
    }
}

// Raw values may hold credentials
impl<T> std::fmt::Debug for Section<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("present", &self.is_present())
            .finish()
    }
}

impl<'de, T> Deserialize<'de> for Section<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// Per-deploy cron document (`conf.cron.json`)
///
/// Each top-level section is decoded by the component that owns it, so a
/// mistake in one section never disables the others.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronConfig {
    /// Deploy groups whose databases are backed up by this deploy's backup job
    #[serde(default)]
    backups: Section<Vec<BackupGroupConfig>>,

    /// DNS records managed by this deploy's IP job
    #[serde(default)]
    records: Section<RecordsConfig>,

    /// Job schedules, keyed by job name, in file order
    #[serde(default)]
    jobs: Section<IndexMap<String, Section<JobConfig>>>,
}

impl CronConfig {
    /// Deploy groups of the `backups` section; empty when absent
    pub fn backup_groups(&self) -> Result<Vec<BackupGroupConfig>> {
        let groups = self
            .backups
            .decode()
            .map_err(|e| Error::config(format!("Invalid backups section: {}", e)))?
            .unwrap_or_default();

        for group in &groups {
            if group.deploy_group_id.trim().is_empty() {
                return Err(Error::config("Backup deployGroupId cannot be empty"));
            }
        }
        Ok(groups)
    }

    /// Validated A records of the `records` section; empty when absent
    pub fn dns_records(&self) -> Result<Vec<DnsRecordConfig>> {
        let records = self
            .records
            .decode()
            .map_err(|e| Error::config(format!("Invalid records section: {}", e)))?
            .unwrap_or_default()
            .a;

        for record in &records {
            record.validate()?;
        }
        Ok(records)
    }

    /// Entries of the `jobs` section in file order, each decoded on demand
    pub fn jobs(&self) -> Result<IndexMap<String, Section<JobConfig>>> {
        self.jobs
            .decode()
            .map(Option::unwrap_or_default)
            .map_err(|e| Error::config(format!("Invalid jobs section: {}", e)))
    }

    /// One job's schedule, `None` when the job is not listed
    pub fn job(&self, name: &str) -> Result<Option<JobConfig>> {
        let Some(section) = self.jobs()?.swap_remove(name) else {
            return Ok(None);
        };
        section
            .decode()
            .map_err(|e| Error::config(format!("Invalid job '{}': {}", name, e)))
    }

    /// Expression for a job, falling back to the given default when the
    /// job is not listed
    ///
    /// The expression itself is not parsed here; the scheduler rejects a
    /// bad one for that job alone.
    pub fn job_expression(&self, name: &str, default: &str) -> Result<String> {
        Ok(self
            .job(name)?
            .map(|job| job.expression)
            .unwrap_or_else(|| default.to_string()))
    }
}

/// A deploy group referenced by the `backups` section
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupGroupConfig {
    /// Group id; resolved through `engine-private/deploy/<id>.router`
    pub deploy_group_id: String,
}

/// DNS records by record type
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsConfig {
    /// A records (IPv4)
    #[serde(rename = "A", default)]
    pub a: Vec<DnsRecordConfig>,
}

/// One A record and the provider that owns it
#[derive(Clone, Deserialize)]
pub struct DnsRecordConfig {
    /// Record host name
    pub host: String,

    /// Provider owning the record
    #[serde(rename = "dns")]
    pub provider: DnsProviderKind,

    /// Provider API key
    /// ⚠️ NEVER log this value
    pub api_key: String,

    /// Provider account user
    pub user: String,
}

impl DnsRecordConfig {
    /// Validate a single record entry
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("DNS record host cannot be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::config(format!(
                "DNS record {} has an empty user",
                self.host
            )));
        }
        if self.api_key.is_empty() {
            return Err(Error::config(format!(
                "DNS record {} has an empty api_key",
                self.host
            )));
        }
        Ok(())
    }
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for DnsRecordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsRecordConfig")
            .field("host", &self.host)
            .field("provider", &self.provider)
            .field("api_key", &"<REDACTED>")
            .field("user", &self.user)
            .finish()
    }
}

/// Known DNS providers
///
/// Unknown names fail to decode the `records` section, so a typo in
/// `conf.cron.json` surfaces as a configuration error of the IP job
/// instead of a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    /// DonDominio DonDNS
    Dondominio,
}

impl DnsProviderKind {
    /// Provider name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProviderKind::Dondominio => "dondominio",
        }
    }
}

impl std::fmt::Display for DnsProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job schedule
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// 5-field cron expression; empty is kept and rejected by the parser
    #[serde(default)]
    pub expression: String,

    /// Whether the job is synchronized into the OS crontab
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Per-deploy server document (`conf.server.json`): host → path → site
///
/// Both levels keep file order. Sites are decoded one at a time so a bad
/// entry only costs its own target.
pub type ServerConfig = IndexMap<String, IndexMap<String, Section<SiteConfig>>>;

/// The backup-relevant part of one `(host, path)` entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    /// Database bound to this site; absent means nothing to back up
    #[serde(default)]
    pub db: Option<DatabaseBinding>,

    /// How often a snapshot is taken, as written
    #[serde(default)]
    pub backup_frequency: Option<String>,

    /// How many snapshots are kept (0 or absent means the default)
    #[serde(default)]
    pub max_backup_retention: Option<usize>,

    /// Replica-only sites are backed up through their primary
    #[serde(default)]
    pub single_replica: bool,
}

impl SiteConfig {
    /// Resolved backup policy with defaults applied
    ///
    /// An unknown frequency falls back to daily.
    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            frequency: self
                .backup_frequency
                .as_deref()
                .and_then(BackupFrequency::parse)
                .unwrap_or_default(),
            max_retention: match self.max_backup_retention {
                Some(0) | None => DEFAULT_MAX_RETENTION,
                Some(n) => n,
            },
        }
    }

    /// The configured frequency when it names no known frequency
    pub fn unknown_frequency(&self) -> Option<&str> {
        self.backup_frequency
            .as_deref()
            .filter(|value| BackupFrequency::parse(value).is_none())
    }
}

/// Database bound to a site
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseBinding {
    /// Database engine, as written
    pub provider: String,

    /// Connection URI
    #[serde(rename = "host")]
    pub connection_uri: String,

    /// Database name
    pub name: String,
}

impl DatabaseBinding {
    /// Engine of the binding; `None` for engines the export cannot handle
    pub fn engine(&self) -> Option<DatabaseProvider> {
        DatabaseProvider::parse(&self.provider)
    }
}

/// Database engines the export command understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseProvider {
    /// MongoDB through mongoose
    Mongoose,
    /// MariaDB
    Mariadb,
}

impl DatabaseProvider {
    /// Parse an engine name as written in configuration
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mongoose" => Some(DatabaseProvider::Mongoose),
            "mariadb" => Some(DatabaseProvider::Mariadb),
            _ => None,
        }
    }

    /// Provider name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseProvider::Mongoose => "mongoose",
            DatabaseProvider::Mariadb => "mariadb",
        }
    }
}

/// Snapshot frequency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupFrequency {
    /// Every hour
    Hourly,
    /// Every 24 hours
    #[default]
    Daily,
    /// Every 7 days
    Weekly,
}

impl BackupFrequency {
    /// Parse a frequency name as written in configuration
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(BackupFrequency::Hourly),
            "daily" => Some(BackupFrequency::Daily),
            "weekly" => Some(BackupFrequency::Weekly),
            _ => None,
        }
    }

    /// Minimum age of the newest snapshot before another one is taken
    pub fn window(&self) -> Duration {
        match self {
            BackupFrequency::Hourly => Duration::from_secs(60 * 60),
            BackupFrequency::Daily => Duration::from_secs(24 * 60 * 60),
            BackupFrequency::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Resolved retention and frequency policy for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Snapshot frequency
    pub frequency: BackupFrequency,
    /// Number of snapshots kept
    pub max_retention: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            frequency: BackupFrequency::Daily,
            max_retention: DEFAULT_MAX_RETENTION,
        }
    }
}

/// Deployment environment, from `NODE_ENV`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Live DNS updates
    Production,
    /// Provider calls are dry-run
    #[default]
    Development,
    /// Provider calls are dry-run
    Test,
}

impl Environment {
    /// Parse an environment name; anything unknown is treated as development
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" => Environment::Production,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }

    /// Whether provider calls hit the network
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Settings for the IP watcher
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Host verified after a DNS update; `None` uses the deploy's first A record
    pub verify_host: Option<String>,

    /// Path appended to the verification URL
    pub verify_path: String,

    /// Capacity of the watcher event channel
    pub event_channel_capacity: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            verify_host: None,
            verify_path: String::new(),
            event_channel_capacity: 256,
        }
    }
}

/// Settings for the backup scheduler
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Export command template
    pub export_command: ExportCommand,

    /// Treat a non-zero export exit code as a failed snapshot
    ///
    /// Off by default: a failed export leaves its directory in place and it
    /// counts towards retention like any other snapshot.
    pub verify_export_exit_code: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            export_command: ExportCommand::default(),
            verify_export_exit_code: false,
        }
    }
}

/// Template for the database export command
///
/// Arguments may contain the placeholders `{host}`, `{path}`,
/// `{deploy_id}`, `{dest}` and `{provider}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCommand {
    /// Program to run
    pub program: String,
    /// Argument templates
    pub args: Vec<String>,
    /// Working directory; `None` inherits the daemon's
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for ExportCommand {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec![
                "bin/db".to_string(),
                "{host}{path}".to_string(),
                "export".to_string(),
                "{deploy_id}".to_string(),
                "{dest}".to_string(),
            ],
            cwd: None,
        }
    }
}
