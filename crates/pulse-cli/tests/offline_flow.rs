//! End-to-end tests of the `pulse` binary without a reachable server.
//!
//! Events recorded while offline must land in the on-disk queue and survive
//! across invocations.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn pulse_binary() -> String {
    env!("CARGO_BIN_EXE_pulse").to_string()
}

/// Runs `pulse` against a server that is never listening, with its queue in `temp`.
fn pulse(temp: &Path, args: &[&str]) -> Output {
    Command::new(pulse_binary())
        .env("HOME", temp)
        .env("XDG_CONFIG_HOME", temp.join(".config"))
        .env("PULSE_SERVER_URL", "http://127.0.0.1:9")
        .env("PULSE_QUEUE_DIR", temp.join("queue"))
        .env("PULSE_SHUTDOWN_GRACE_MS", "500")
        .env("PULSE_REQUEST_TIMEOUT_MS", "500")
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to run pulse")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "pulse should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

#[test]
fn test_heartbeat_offline_is_queued() {
    let temp = TempDir::new().unwrap();

    let output = pulse(
        temp.path(),
        &["heartbeat", "--bucket", "window", "--data", "app=Firefox", "--pulsetime", "5"],
    );
    assert_eq!(
        stdout(&output),
        "Queued heartbeat for window; 1 event(s) awaiting delivery.\n"
    );

    let queue = stdout(&pulse(temp.path(), &["queue"]));
    assert!(queue.contains("- window: 1 pending"), "{queue}");
    assert!(queue.contains("Total: 1"), "{queue}");
}

#[test]
fn test_queue_accumulates_across_invocations() {
    let temp = TempDir::new().unwrap();

    for app in ["A", "B", "C"] {
        let data = format!("app={app}");
        stdout(&pulse(
            temp.path(),
            &["insert", "--bucket", "window", "--data", &data, "--duration", "1.5"],
        ));
    }
    stdout(&pulse(
        temp.path(),
        &["insert", "--bucket", "afk", "--data", "status=\"afk\""],
    ));

    let queue = stdout(&pulse(temp.path(), &["queue"]));
    assert!(queue.contains("- afk: 1 pending"), "{queue}");
    assert!(queue.contains("- window: 3 pending"), "{queue}");
    assert!(queue.contains("Total: 4"), "{queue}");
}

#[test]
fn test_flush_keeps_events_when_offline() {
    let temp = TempDir::new().unwrap();
    stdout(&pulse(
        temp.path(),
        &["insert", "--bucket", "window", "--data", "app=X"],
    ));

    let flush = stdout(&pulse(temp.path(), &["flush", "--grace-ms", "200"]));
    assert_eq!(flush, "Delivered 0, dropped 0, 1 still queued.\n");

    let queue = stdout(&pulse(temp.path(), &["queue"]));
    assert!(queue.contains("Total: 1"), "{queue}");
}

#[test]
fn test_invalid_data_is_rejected() {
    let temp = TempDir::new().unwrap();
    let output = pulse(temp.path(), &["heartbeat", "--bucket", "window", "--data", "app"]);
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("expected KEY=VALUE"),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_query_requires_reachable_server() {
    let temp = TempDir::new().unwrap();
    let output = pulse(
        temp.path(),
        &[
            "query",
            "--bucket",
            "window",
            "--start",
            "2025-01-06T00:00:00Z",
            "--end",
            "2025-01-07T00:00:00Z",
        ],
    );
    assert!(!output.status.success(), "queries are never queued");
}
