//! Access to the `engine-private/` configuration tree
//!
//! ```text
//! engine-private/
//! ├── conf/<deployId>/conf.cron.json
//! ├── conf/<deployId>/conf.server.json
//! ├── replica/<deployId>/conf.server.json   (preferred when present)
//! ├── deploy/<groupId>.router               (comma-separated deploy ids)
//! ├── cron-backups/<host><path>/<epochMs>/
//! └── cron-state.json
//! ```
//!
//! Nothing is cached: every call re-reads the file, so a tick always sees
//! the configuration as it is on disk.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::{CronConfig, ServerConfig};
use crate::{Error, Result};

const PRIVATE_DIR: &str = "engine-private";
const CRON_FILE: &str = "conf.cron.json";
const SERVER_FILE: &str = "conf.server.json";

/// Reads and writes the per-deploy configuration documents
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Create a store rooted at the workspace that contains `engine-private/`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `engine-private/` directory
    pub fn private_dir(&self) -> PathBuf {
        self.root.join(PRIVATE_DIR)
    }

    /// Path of the persisted watcher state
    pub fn state_path(&self) -> PathBuf {
        self.private_dir().join("cron-state.json")
    }

    /// Root of all snapshot directories
    pub fn backups_root(&self) -> PathBuf {
        self.private_dir().join("cron-backups")
    }

    /// Snapshot directory of one `(host, path)` target
    pub fn backup_dir(&self, host: &str, path: &str) -> PathBuf {
        self.backups_root().join(backup_folder_name(host, path))
    }

    /// Path of a deploy's cron document
    pub fn cron_config_path(&self, deploy_id: &str) -> Result<PathBuf> {
        validate_id(deploy_id)?;
        Ok(self.private_dir().join("conf").join(deploy_id).join(CRON_FILE))
    }

    /// Path of the server document in effect for a deploy
    ///
    /// The replica copy wins when it exists: after a blue/green switch it
    /// holds the active configuration.
    pub fn server_config_path(&self, deploy_id: &str) -> Result<PathBuf> {
        validate_id(deploy_id)?;
        let replica = self
            .private_dir()
            .join("replica")
            .join(deploy_id)
            .join(SERVER_FILE);
        if replica.exists() {
            return Ok(replica);
        }
        Ok(self.private_dir().join("conf").join(deploy_id).join(SERVER_FILE))
    }

    /// Load a deploy's cron document
    ///
    /// Only the JSON shape is checked here; each section is validated by
    /// the component that reads it.
    pub async fn load_cron_config(&self, deploy_id: &str) -> Result<CronConfig> {
        let path = self.cron_config_path(deploy_id)?;
        read_json(&path).await
    }

    /// Load the server document in effect for a deploy
    pub async fn load_server_config(&self, deploy_id: &str) -> Result<ServerConfig> {
        let path = self.server_config_path(deploy_id)?;
        read_json(&path).await
    }

    /// Deploy ids belonging to a group, in file order
    pub async fn load_deploy_group(&self, group_id: &str) -> Result<Vec<String>> {
        validate_id(group_id)?;
        let path = self
            .private_dir()
            .join("deploy")
            .join(format!("{}.router", group_id));

        let content = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("Deploy group file {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;

        Ok(split_deploy_list(&content))
    }
}

/// Split a comma-separated deploy list, dropping blanks
pub fn split_deploy_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Folder name of a target's snapshots: host followed by the path with
/// separators flattened (`example.com` + `/api` → `example.com-api`)
pub fn backup_folder_name(host: &str, path: &str) -> String {
    let flattened: String = path
        .chars()
        .filter(|c| *c != '\\')
        .map(|c| if c == '/' { '-' } else { c })
        .collect();
    format!("{}{}", host, flattened)
}

/// Reject ids that would escape their directory
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        return Err(Error::invalid_input(format!("Invalid deploy id '{}'", id)));
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("Configuration file {}", path.display()))
        } else {
            Error::Io(e)
        }
    })?;

    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("Invalid JSON in {}: {}", path.display(), e)))
}
