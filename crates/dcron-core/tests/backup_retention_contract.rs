//! Contract Test: Rolling backups
//!
//! Constraints verified:
//! - Retention keeps exactly the `maxBackupRetention` newest snapshots
//! - The frequency gate blocks snapshots inside the window
//! - Forced runs always produce a new, strictly newer snapshot
//! - Sites without a database, or marked single replica, are never exported
//! - The replica server config wins over the primary one
//! - Export failures follow the exit-code setting
//! - Mistakes in other sections, or in other sites, never cost a target
//! - Targets are visited in configuration-file order

mod common;

use common::*;
use dcron_core::config::BackupSettings;
use dcron_core::{BackupScheduler, RunOptions, TargetOutcome};

const HOST: &str = "example.com";
const PATH: &str = "/api";

fn server_config(extra: &str) -> String {
    format!(
        r#"{{ "{}": {{ "{}": {{ "db": {{ "provider": "mongoose", "host": "mongodb://127.0.0.1:27017", "name": "example" }}{} }} }} }}"#,
        HOST, PATH, extra
    )
}

/// Deploy `dd-core` backs up group `dd` made of `dd-a`
fn workspace_with_target(site_extra: &str) -> Workspace {
    let ws = Workspace::new();
    ws.write_cron_config("dd-core", r#"{ "backups": [{ "deployGroupId": "dd" }] }"#);
    ws.write_deploy_group("dd", "dd-a");
    ws.write_server_config("dd-a", &server_config(site_extra));
    ws
}

fn scheduler(ws: &Workspace, runner: std::sync::Arc<RecordingProcessRunner>) -> BackupScheduler {
    BackupScheduler::new("dd-core", ws.store.clone(), runner, BackupSettings::default())
}

#[tokio::test]
async fn retention_keeps_newest_snapshots_when_none_is_due() {
    let ws = workspace_with_target(r#", "maxBackupRetention": 3"#);
    let now = now_ms();
    let stamps: Vec<i64> = (1..=7).map(|i| now - i * MINUTE_MS).collect();
    ws.make_snapshots(HOST, PATH, &stamps);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(ws.snapshots(HOST, PATH), stamps[..3].to_vec());
    assert_eq!(summary.not_due(), 1);
    assert_eq!(summary.targets[0].pruned.len(), 4);
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn retention_keeps_everything_below_the_bound() {
    let ws = workspace_with_target(r#", "maxBackupRetention": 5"#);
    let now = now_ms();
    let stamps = vec![now - MINUTE_MS, now - 2 * MINUTE_MS];
    ws.make_snapshots(HOST, PATH, &stamps);

    scheduler(&ws, RecordingProcessRunner::new()).run_once().await;

    assert_eq!(ws.snapshots(HOST, PATH), stamps);
}

#[tokio::test]
async fn frequency_gate_blocks_new_snapshot() {
    let ws = workspace_with_target(r#", "backupFrequency": "daily""#);
    let newest = now_ms() - HOUR_MS;
    ws.make_snapshots(HOST, PATH, &[newest]);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(ws.snapshots(HOST, PATH), vec![newest]);
    assert_eq!(summary.targets[0].outcome, TargetOutcome::NotDue { newest });
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn hourly_frequency_takes_snapshot_after_an_hour() {
    let ws = workspace_with_target(r#", "backupFrequency": "hourly""#);
    let newest = now_ms() - 2 * HOUR_MS;
    ws.make_snapshots(HOST, PATH, &[newest]);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(summary.created(), 1);
    assert_eq!(ws.snapshots(HOST, PATH).len(), 2);
}

#[tokio::test]
async fn due_snapshot_brings_total_to_retention_bound() {
    let ws = workspace_with_target(r#", "maxBackupRetention": 3"#);
    let now = now_ms();
    let old: Vec<i64> = (2..=6).map(|i| now - i * DAY_MS).collect();
    ws.make_snapshots(HOST, PATH, &old);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    let remaining = ws.snapshots(HOST, PATH);
    assert_eq!(remaining.len(), 3);
    assert!(remaining[0] >= now, "Newest snapshot is the one just taken");
    assert_eq!(&remaining[1..], &old[..2]);

    // node bin/db example.com/api export dd-a <dest>
    let commands = runner.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].program, "node");
    assert_eq!(commands[0].args[0], "bin/db");
    assert_eq!(commands[0].args[1], "example.com/api");
    assert_eq!(commands[0].args[2], "export");
    assert_eq!(commands[0].args[3], "dd-a");
    let TargetOutcome::Created { snapshot, .. } = &summary.targets[0].outcome else {
        panic!("expected a snapshot, got {:?}", summary.targets[0].outcome);
    };
    assert_eq!(commands[0].args[4], snapshot.display().to_string());
    assert_eq!(commands[0].cwd.as_deref(), Some(ws.dir.path()));
}

#[tokio::test]
async fn forced_runs_produce_strictly_increasing_snapshots() {
    let ws = workspace_with_target("");
    let scheduler = scheduler(&ws, RecordingProcessRunner::new());
    let force = RunOptions { force: true };

    scheduler.run(force).await;
    scheduler.run(force).await;

    let snapshots = ws.snapshots(HOST, PATH);
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0] > snapshots[1]);
}

#[tokio::test]
async fn sites_without_database_or_single_replica_are_skipped() {
    let ws = Workspace::new();
    ws.write_cron_config("dd-core", r#"{ "backups": [{ "deployGroupId": "dd" }] }"#);
    ws.write_deploy_group("dd", "dd-a");
    ws.write_server_config(
        "dd-a",
        r#"{
            "example.com": {
                "/": {},
                "/replica": {
                    "db": { "provider": "mariadb", "host": "127.0.0.1", "name": "r" },
                    "singleReplica": true
                }
            }
        }"#,
    );
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert!(summary.targets.is_empty());
    assert_eq!(runner.call_count(), 0);
    assert!(!ws.store.backups_root().exists());
}

#[tokio::test]
async fn missing_backups_section_does_nothing() {
    let ws = Workspace::new();
    ws.write_cron_config("dd-core", r#"{ "records": { "A": [] } }"#);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert!(summary.targets.is_empty());
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn replica_server_config_is_preferred() {
    let ws = workspace_with_target("");
    ws.write_replica_server_config(
        "dd-a",
        r#"{ "replica.example.com": { "/": { "db": { "provider": "mongoose", "host": "mongodb://10.0.0.2", "name": "r" } } } }"#,
    );
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(summary.targets.len(), 1);
    assert_eq!(summary.targets[0].host, "replica.example.com");
    assert_eq!(ws.snapshots("replica.example.com", "/").len(), 1);
    assert!(ws.snapshots(HOST, PATH).is_empty());
}

#[tokio::test]
async fn broken_group_does_not_stop_other_groups() {
    let ws = Workspace::new();
    ws.write_cron_config(
        "dd-core",
        r#"{ "backups": [{ "deployGroupId": "missing" }, { "deployGroupId": "dd" }] }"#,
    );
    ws.write_deploy_group("dd", "dd-a, dd-b");
    ws.write_server_config("dd-a", "not json");
    ws.write_server_config("dd-b", &server_config(""));
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(summary.created(), 1);
    assert_eq!(summary.targets[0].deploy_id, "dd-b");
}

#[tokio::test]
async fn failed_export_is_kept_by_default() {
    let ws = workspace_with_target("");
    let runner = RecordingProcessRunner::new();
    runner.set_exit_code(1);

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(summary.created(), 1);
    assert!(matches!(
        summary.targets[0].outcome,
        TargetOutcome::Created { exit_code: Some(1), .. }
    ));
    assert_eq!(ws.snapshots(HOST, PATH).len(), 1);
}

#[tokio::test]
async fn failed_export_is_removed_when_exit_codes_are_checked() {
    let ws = workspace_with_target("");
    let runner = RecordingProcessRunner::new();
    runner.set_exit_code(1);
    let settings = BackupSettings {
        verify_export_exit_code: true,
        ..BackupSettings::default()
    };

    let summary = BackupScheduler::new("dd-core", ws.store.clone(), runner, settings)
        .run_once()
        .await;

    assert_eq!(summary.failed(), 1);
    assert!(ws.snapshots(HOST, PATH).is_empty());
}

#[tokio::test]
async fn invalid_job_and_record_do_not_stop_backups() {
    let ws = workspace_with_target("");
    ws.write_cron_config(
        "dd-core",
        r#"{
            "backups": [{ "deployGroupId": "dd" }],
            "records": { "A": [{ "host": "example.com", "dns": "nope", "api_key": "k", "user": "u" }] },
            "jobs": { "backups": { "expression": "" } }
        }"#,
    );
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    assert_eq!(summary.created(), 1);
    assert_eq!(runner.call_count(), 1);
}

#[tokio::test]
async fn healthy_site_is_backed_up_next_to_malformed_ones() {
    let ws = Workspace::new();
    ws.write_cron_config("dd-core", r#"{ "backups": [{ "deployGroupId": "dd" }] }"#);
    ws.write_deploy_group("dd", "dd-a");
    ws.write_server_config(
        "dd-a",
        r#"{
            "z.example.com": {
                "/": { "db": { "provider": "mongoose", "host": "mongodb://127.0.0.1", "name": "z" } }
            },
            "a.example.com": {
                "/": {
                    "db": { "provider": "mariadb", "host": "127.0.0.1", "name": "a" },
                    "backupFrequency": "monthly"
                },
                "/pg": { "db": { "provider": "postgres", "host": "127.0.0.1", "name": "pg" } },
                "/broken": { "db": "mongodb://127.0.0.1" }
            }
        }"#,
    );
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    // postgres and the broken entry are skipped, monthly falls back to daily
    let targets: Vec<_> = summary
        .targets
        .iter()
        .map(|t| format!("{}{}", t.host, t.path))
        .collect();
    assert_eq!(targets, vec!["z.example.com/", "a.example.com/"]);
    assert_eq!(summary.created(), 2);
    assert_eq!(runner.call_count(), 2);
    assert!(ws.snapshots("a.example.com", "/pg").is_empty());
}

#[tokio::test]
async fn unknown_frequency_uses_the_daily_window() {
    let ws = workspace_with_target(r#", "backupFrequency": "monthly""#);
    let newest = now_ms() - 2 * HOUR_MS;
    ws.make_snapshots(HOST, PATH, &[newest]);

    let summary = scheduler(&ws, RecordingProcessRunner::new()).run_once().await;

    assert_eq!(summary.targets[0].outcome, TargetOutcome::NotDue { newest });
}

#[tokio::test]
async fn targets_follow_server_config_order() {
    let ws = Workspace::new();
    ws.write_cron_config("dd-core", r#"{ "backups": [{ "deployGroupId": "dd" }] }"#);
    ws.write_deploy_group("dd", "dd-a");
    ws.write_server_config(
        "dd-a",
        r#"{
            "z.example.com": {
                "/b": { "db": { "provider": "mongoose", "host": "mongodb://127.0.0.1", "name": "zb" } },
                "/a": { "db": { "provider": "mongoose", "host": "mongodb://127.0.0.1", "name": "za" } }
            },
            "a.example.com": {
                "/": { "db": { "provider": "mongoose", "host": "mongodb://127.0.0.1", "name": "a" } }
            }
        }"#,
    );
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run_once().await;

    let hosts: Vec<_> = summary
        .targets
        .iter()
        .map(|t| format!("{}{}", t.host, t.path))
        .collect();
    assert_eq!(hosts, vec!["z.example.com/b", "z.example.com/a", "a.example.com/"]);
    let exported: Vec<_> = runner.commands().iter().map(|c| c.args[1].clone()).collect();
    assert_eq!(exported, vec!["z.example.com/b", "z.example.com/a", "a.example.com/"]);
}

#[tokio::test]
async fn forced_run_past_the_last_snapshot_name_fails_the_target() {
    let ws = workspace_with_target("");
    ws.make_snapshots(HOST, PATH, &[i64::MAX]);
    let runner = RecordingProcessRunner::new();

    let summary = scheduler(&ws, runner.clone()).run(RunOptions { force: true }).await;

    assert_eq!(summary.failed(), 1);
    assert_eq!(runner.call_count(), 0);
    assert_eq!(ws.snapshots(HOST, PATH), vec![i64::MAX]);
}
