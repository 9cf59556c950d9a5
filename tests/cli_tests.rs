//! Integration tests for vpnctl
//!
//! Only actions that stay inside a temp project directory are exercised here;
//! anything touching docker, ufw or the panel is covered by unit tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV: &str = "\
# deployment secrets
SERVER_IP=203.0.113.5
VLESS_UUID=b831381d-6324-4d53-ad4f-8cda48b30811
REALITY_PUBLIC_KEY=Xq1mV2Jk3e4qz9yA0Qk7p0p6Ww2cH5n8B3sD4fG5hJ0
REALITY_SHORT_ID=0123abcd
REALITY_SNI=www.microsoft.com
HYSTERIA_PASSWORD=main-pass
HYSTERIA_OBFS_PASSWORD=obfs-pass
HYSTERIA_PORT=8443
";

/// vpnctl pointed at a temp project dir and a config file that does not exist
fn vpnctl(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("vpnctl").unwrap();
    cmd.env_remove("RUST_LOG")
        .arg("--config")
        .arg(dir.path().join("vpnctl.toml"))
        .arg("--project-dir")
        .arg(dir.path());
    cmd
}

#[test]
fn test_help_command() {
    Command::cargo_bin("vpnctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN gateway control tool"))
        .stdout(predicate::str::contains("--show-clients"))
        .stdout(predicate::str::contains("rotate"));
}

#[test]
fn test_no_action_fails() {
    let dir = TempDir::new().unwrap();
    vpnctl(&dir)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Nothing to do"));
}

#[test]
fn test_show_clients() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".env"), ENV).unwrap();

    vpnctl(&dir)
        .arg("--show-clients")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "vless://b831381d-6324-4d53-ad4f-8cda48b30811@203.0.113.5:443?",
        ))
        .stdout(predicate::str::contains(
            "hysteria2://main-pass@203.0.113.5:8443?insecure=1&sni=www.microsoft.com&obfs=salamander&obfs-password=obfs-pass#VPN-Hysteria2",
        ));
}

#[test]
fn test_show_clients_json() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".env"), ENV).unwrap();

    let output = vpnctl(&dir)
        .args(["-o", "json", "--show-clients"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let clients = value["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 2);
    assert_eq!(clients[0]["label"], "VLESS + REALITY");
    assert_eq!(clients[1]["label"], "Hysteria 2");
}

#[test]
fn test_show_clients_without_keys() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".env"), "SERVER_IP=203.0.113.5\n").unwrap();

    vpnctl(&dir)
        .arg("--show-clients")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("VLESS_UUID"));
}

#[test]
fn test_port_validation_rejects_before_changes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".env"), ENV).unwrap();

    for (target, port) in [("hysteria", "0"), ("hysteria", "70000"), ("hysteria", "-1"), ("panel", "80")] {
        vpnctl(&dir)
            .args(["port", target, "--", port])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("Invalid parameter"));
    }

    assert_eq!(fs::read_to_string(dir.path().join(".env")).unwrap(), ENV);
}
