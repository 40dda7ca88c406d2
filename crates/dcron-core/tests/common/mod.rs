//! Test doubles and fixtures shared by the contract tests
//!
//! Every capability the core consumes (IP resolution, connectivity,
//! propagation checks, DNS providers, processes) has a double here that
//! records how it was used.

#![allow(dead_code)]

use async_trait::async_trait;
use dcron_core::config::DnsProviderKind;
use dcron_core::error::{Error, Result};
use dcron_core::traits::{
    CommandSpec, ConnectivityProbe, DnsProvider, IpSource, ProcessOutput, ProcessRunner,
    PropagationVerifier, UpdateOptions,
};
use dcron_core::ConfigStore;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// An IpSource whose answer the test controls
pub struct FixedIpSource {
    ip: Mutex<Option<IpAddr>>,
    call_count: AtomicUsize,
}

impl FixedIpSource {
    pub fn new(ip: &str) -> Arc<Self> {
        Arc::new(Self {
            ip: Mutex::new(Some(ip.parse().unwrap())),
            call_count: AtomicUsize::new(0),
        })
    }

    /// Change the address returned from now on
    pub fn set(&self, ip: &str) {
        *self.ip.lock().unwrap() = Some(ip.parse().unwrap());
    }

    /// Make resolution fail
    pub fn fail(&self) {
        *self.ip.lock().unwrap() = None;
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpSource for FixedIpSource {
    async fn current(&self) -> Result<IpAddr> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.ip
            .lock()
            .unwrap()
            .ok_or_else(|| Error::ip_source("resolution failed"))
    }
}

/// A connectivity probe with a fixed answer
pub struct StaticProbe(pub bool);

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        self.0
    }
}

/// A verifier that answers from a scripted address and records requests
pub struct ScriptedVerifier {
    answer: Mutex<Option<IpAddr>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedVerifier {
    /// Answer with `ip` on every request
    pub fn answering(ip: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Some(ip.parse().unwrap())),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, ip: &str) {
        *self.answer.lock().unwrap() = Some(ip.parse().unwrap());
    }

    /// `(host, path)` of every request
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PropagationVerifier for ScriptedVerifier {
    async fn remote_addr(&self, host: &str, path: &str) -> Result<IpAddr> {
        self.requests
            .lock()
            .unwrap()
            .push((host.to_string(), path.to_string()));
        self.answer
            .lock()
            .unwrap()
            .ok_or_else(|| Error::verification("connection refused"))
    }
}

/// A DNS provider that records every update
pub struct MockDnsProvider {
    updates: Mutex<Vec<UpdateOptions>>,
    accept: AtomicBool,
}

impl MockDnsProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        })
    }

    pub fn update_call_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn updates(&self) -> Vec<UpdateOptions> {
        self.updates.lock().unwrap().clone()
    }

    /// Value returned by `update`
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    async fn update(&self, options: &UpdateOptions) -> Result<bool> {
        self.updates.lock().unwrap().push(options.clone());
        Ok(self.accept.load(Ordering::SeqCst))
    }

    fn kind(&self) -> DnsProviderKind {
        DnsProviderKind::Dondominio
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// A process runner that records commands and answers with a fixed exit code
pub struct RecordingProcessRunner {
    commands: Mutex<Vec<CommandSpec>>,
    exit_code: Mutex<i32>,
}

impl RecordingProcessRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            exit_code: Mutex::new(0),
        })
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap() = code;
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessRunner for RecordingProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutput> {
        self.commands.lock().unwrap().push(command.clone());
        let code = *self.exit_code.lock().unwrap();
        Ok(ProcessOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: if code == 0 { String::new() } else { "export failed".to_string() },
        })
    }
}

/// An in-memory `crontab` binary
pub struct FakeCrontab {
    content: Mutex<Option<String>>,
    installs: AtomicUsize,
}

impl FakeCrontab {
    pub fn new(initial: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            content: Mutex::new(initial.map(str::to_string)),
            installs: AtomicUsize::new(0),
        })
    }

    pub fn content(&self) -> Option<String> {
        self.content.lock().unwrap().clone()
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeCrontab {
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutput> {
        assert_eq!(command.program, "crontab");
        match command.args.first().map(String::as_str) {
            Some("-l") => Ok(match self.content() {
                Some(content) => ProcessOutput {
                    exit_code: Some(0),
                    stdout: content,
                    stderr: String::new(),
                },
                None => ProcessOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "no crontab for dcron".to_string(),
                },
            }),
            Some("-") => {
                *self.content.lock().unwrap() = command.stdin.clone();
                self.installs.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessOutput {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
            other => panic!("unexpected crontab arguments {:?}", other),
        }
    }
}

/// A temporary workspace with an `engine-private/` tree
pub struct Workspace {
    pub dir: TempDir,
    pub store: ConfigStore,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        Self { dir, store }
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.store.private_dir().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn write_cron_config(&self, deploy_id: &str, json: &str) {
        self.write(&format!("conf/{}/conf.cron.json", deploy_id), json);
    }

    pub fn write_server_config(&self, deploy_id: &str, json: &str) {
        self.write(&format!("conf/{}/conf.server.json", deploy_id), json);
    }

    pub fn write_replica_server_config(&self, deploy_id: &str, json: &str) {
        self.write(&format!("replica/{}/conf.server.json", deploy_id), json);
    }

    pub fn write_deploy_group(&self, group_id: &str, deploy_ids: &str) {
        self.write(&format!("deploy/{}.router", group_id), deploy_ids);
    }

    /// Cron config with one A record on `host`
    pub fn write_dns_record(&self, deploy_id: &str, host: &str) {
        self.write_cron_config(
            deploy_id,
            &format!(
                r#"{{ "records": {{ "A": [{{ "host": "{}", "dns": "dondominio", "api_key": "secret-key", "user": "owner" }}] }} }}"#,
                host
            ),
        );
    }

    /// Create snapshot directories for a target
    pub fn make_snapshots(&self, host: &str, path: &str, stamps: &[i64]) {
        let dir = self.store.backup_dir(host, path);
        for stamp in stamps {
            std::fs::create_dir_all(dir.join(stamp.to_string())).unwrap();
        }
    }

    /// Snapshot timestamps of a target, newest first
    pub fn snapshots(&self, host: &str, path: &str) -> Vec<i64> {
        let dir = self.store.backup_dir(host, path);
        let mut stamps: Vec<i64> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
                .collect(),
            Err(_) => Vec::new(),
        };
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        stamps
    }

    pub fn backup_dir(&self, host: &str, path: &str) -> PathBuf {
        self.store.backup_dir(host, path)
    }
}

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
