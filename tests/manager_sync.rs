//! Supervisor reconciliation and RPC-surface tests.
//!
//! These drive a [`Manager`] against a temporary config directory with a
//! stub spawner, so "listener children" are plain `sleep` processes.

use std::time::Duration;

use tempfile::TempDir;

use vsbmc::config::{BmcConfig, ProcessConfig};
use vsbmc::control::Request;
use vsbmc::manager::{Manager, Spawner};

struct SleepSpawner;

impl Spawner for SleepSpawner {
    fn spawn(&self, _config: &BmcConfig) -> vsbmc::Result<tokio::process::Child> {
        tokio::process::Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .map_err(Into::into)
    }
}

/// A spawner whose children exit immediately, for dead-child handling.
struct ExitingSpawner;

impl Spawner for ExitingSpawner {
    fn spawn(&self, _config: &BmcConfig) -> vsbmc::Result<tokio::process::Child> {
        tokio::process::Command::new("true")
            .kill_on_drop(true)
            .spawn()
            .map_err(Into::into)
    }
}

fn manager_with(dir: &TempDir, spawner: Box<dyn Spawner>) -> Manager {
    let config = ProcessConfig {
        config_dir: dir.path().to_path_buf(),
        server_port: 0,
        server_response_timeout: Duration::from_secs(1),
        session_timeout: Duration::from_secs(30),
        show_passwords: false,
    };
    Manager::with_spawner(config, spawner).unwrap()
}

fn manager(dir: &TempDir) -> Manager {
    manager_with(dir, Box::new(SleepSpawner))
}

fn add_request(vm_name: &str) -> Request {
    Request::Add {
        vm_name: vm_name.to_string(),
        vm_uuid: None,
        username: None,
        password: None,
        port: None,
        address: None,
        fakemac: None,
        viserver: Some("vcenter.example.com".to_string()),
        viserver_username: Some("administrator@vsphere.local".to_string()),
        viserver_password: Some("secret".to_string()),
    }
}

async fn status_of(manager: &mut Manager, vm_name: &str) -> String {
    let reply = manager
        .handle_request(Request::List { fakemac: false })
        .await;
    assert_eq!(reply.rc, 0);
    reply
        .rows
        .unwrap()
        .into_iter()
        .find(|row| row[0] == vm_name)
        .map(|row| row[1].clone())
        .unwrap_or_else(|| "absent".to_string())
}

#[tokio::test]
async fn sync_is_idempotent_across_start_stop_cycles() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    let reply = manager.handle_request(add_request("vm0")).await;
    assert_eq!(reply.rc, 0, "{:?}", reply.msg);
    assert_eq!(status_of(&mut manager, "vm0").await, "down");

    let reply = manager
        .handle_request(Request::Start {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 0, "{:?}", reply.msg);
    assert_eq!(status_of(&mut manager, "vm0").await, "running");

    // Two consecutive passes leave exactly one live child.
    manager.sync(false).await;
    manager.sync(false).await;
    assert_eq!(status_of(&mut manager, "vm0").await, "running");

    // Starting an already-running VM succeeds silently.
    let reply = manager
        .handle_request(Request::Start {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 0);

    let reply = manager
        .handle_request(Request::Stop {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 0);
    manager.sync(false).await;
    assert_eq!(status_of(&mut manager, "vm0").await, "down");

    let reply = manager
        .handle_request(Request::Start {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 0);
    assert_eq!(status_of(&mut manager, "vm0").await, "running");
}

#[tokio::test]
async fn shutdown_pass_terminates_everything() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    for vm_name in ["vm0", "vm1"] {
        manager.handle_request(add_request(vm_name)).await;
        manager
            .handle_request(Request::Start {
                vm_names: vec![vm_name.to_string()],
            })
            .await;
        assert_eq!(status_of(&mut manager, vm_name).await, "running");
    }

    manager.sync(true).await;
    assert_eq!(status_of(&mut manager, "vm0").await, "down");
    assert_eq!(status_of(&mut manager, "vm1").await, "down");
}

#[tokio::test]
async fn add_fails_when_the_directory_exists() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    assert_eq!(manager.handle_request(add_request("vm0")).await.rc, 0);
    let reply = manager.handle_request(add_request("vm0")).await;
    assert_eq!(reply.rc, 1);
    assert!(reply.msg[0].contains("already exists"), "{:?}", reply.msg);

    // The config survived the failed re-add.
    assert!(dir.path().join("vm0").join("config").exists());
}

#[tokio::test]
async fn add_rejects_mixed_vi_credentials() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    let reply = manager
        .handle_request(Request::Add {
            vm_name: "vm0".to_string(),
            vm_uuid: None,
            username: None,
            password: None,
            port: None,
            address: None,
            fakemac: None,
            viserver: Some("vcenter.example.com".to_string()),
            viserver_username: Some("administrator@vsphere.local".to_string()),
            viserver_password: None,
        })
        .await;
    assert_eq!(reply.rc, 1);
    assert!(!dir.path().join("vm0").exists());
}

#[tokio::test]
async fn delete_stops_the_listener_and_removes_the_directory() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    manager.handle_request(add_request("vm0")).await;
    manager
        .handle_request(Request::Start {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(status_of(&mut manager, "vm0").await, "running");

    let reply = manager
        .handle_request(Request::Delete {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 0, "{:?}", reply.msg);
    assert!(!dir.path().join("vm0").exists());
    assert_eq!(status_of(&mut manager, "vm0").await, "absent");

    let reply = manager
        .handle_request(Request::Delete {
            vm_names: vec!["vm0".to_string()],
        })
        .await;
    assert_eq!(reply.rc, 1);
    assert!(reply.msg[0].contains("No VM with matching name"));
}

#[tokio::test]
async fn list_rows_are_sorted_and_carry_the_fakemac_column_on_request() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    for vm_name in ["charlie", "alpha", "bravo"] {
        manager.handle_request(add_request(vm_name)).await;
    }

    let reply = manager
        .handle_request(Request::List { fakemac: false })
        .await;
    let rows = reply.rows.unwrap();
    let names: Vec<&str> = rows.iter().map(|row| row[0].as_str()).collect();
    assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    assert_eq!(reply.header.unwrap().len(), 4);

    let reply = manager
        .handle_request(Request::List { fakemac: true })
        .await;
    let header = reply.header.unwrap();
    assert_eq!(header.last().map(String::as_str), Some("Fake MAC"));
    for row in reply.rows.unwrap() {
        assert_eq!(row.len(), 5);
        assert!(row[4].starts_with("02:00:00:"));
    }
}

#[tokio::test]
async fn list_skips_directories_that_are_not_vms() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    manager.handle_request(add_request("vm0")).await;
    std::fs::create_dir(dir.path().join("not-a-vm")).unwrap();

    let reply = manager
        .handle_request(Request::List { fakemac: false })
        .await;
    let rows = reply.rows.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], "vm0");
}

#[tokio::test]
async fn show_redacts_passwords_and_reports_status() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager(&dir);

    manager.handle_request(add_request("vm0")).await;
    let reply = manager
        .handle_request(Request::Show {
            vm_name: "vm0".to_string(),
        })
        .await;
    assert_eq!(reply.rc, 0);
    let rows = reply.rows.unwrap();

    let value_of = |key: &str| {
        rows.iter()
            .find(|row| row[0] == key)
            .map(|row| row[1].clone())
    };
    assert_eq!(value_of("password").as_deref(), Some("***"));
    assert_eq!(value_of("viserver_password").as_deref(), Some("***"));
    assert_eq!(value_of("status").as_deref(), Some("down"));
    assert_eq!(
        value_of("viserver").as_deref(),
        Some("vcenter.example.com")
    );
}

#[tokio::test]
async fn dead_children_surface_as_error_then_get_reaped() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with(&dir, Box::new(ExitingSpawner));

    manager.handle_request(add_request("vm0")).await;
    manager
        .handle_request(Request::Start {
            vm_names: vec!["vm0".to_string()],
        })
        .await;

    // Let the stub child exit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&mut manager, "vm0").await, "error");

    // The next pass reaps the corpse; the one after respawns. Neither
    // pass may fail or leak.
    manager.sync(false).await;
    manager.sync(false).await;
    let status = status_of(&mut manager, "vm0").await;
    assert!(
        status == "running" || status == "error" || status == "down",
        "unexpected status {}",
        status
    );
}
