//! Command-line tests for the veilseed binary

use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

fn veilseed() -> Command {
    Command::new(env!("CARGO_BIN_EXE_veilseed"))
}

#[test]
fn test_check_config_prints_key() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[tunnel_community]\nmin_circuits = 2\nmax_circuits = 4").unwrap();

    let output = veilseed()
        .args(["--config", file.path().to_str().unwrap()])
        .args(["check-config", "--key", "tunnel_community/min_circuits"])
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "2");
}

#[test]
fn test_check_config_defaults() {
    let output = veilseed()
        .args(["check-config", "--key", "libtorrent/socks_listen_ports"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let ports: Vec<u16> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(ports, vec![0, 0, 0]);
}

#[test]
fn test_invalid_config_fails() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[tunnel_community]\nmin_circuits = 5\nmax_circuits = 2").unwrap();

    let output = veilseed()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_unknown_key_fails() {
    let output = veilseed()
        .args(["check-config", "--key", "tunnel_community/no_such_key"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}
