//! Smoke integration tests for nanoclawd.
//!
//! These spawn the actual binary with a minimal config pointed at a temp
//! directory, then verify startup side effects on disk and a graceful
//! shutdown. No Docker and no chat tokens: every transport stays disabled
//! and sandbox spawns are never reached.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nanoclaw_core::store::{Message, RegisteredGroup, Store, now_rfc3339};

fn write_test_config(dir: &tempfile::TempDir) -> PathBuf {
    let base = dir.path().display();
    let config_path = dir.path().join("nanoclaw.toml");
    let toml = format!(
        r#"
[storage]
db_path = "{base}/store/nanoclaw.db"
data_dir = "{base}/data"
groups_dir = "{base}/groups"

[orchestrator]
poll_interval_ms = 200

[ipc]
poll_interval_ms = 200

[scheduler]
poll_interval_ms = 500
"#
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

fn nanoclawd_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "nanoclawd", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/nanoclawd")
}

struct TestDaemon {
    child: Child,
}

impl TestDaemon {
    fn start(config_path: &PathBuf) -> Self {
        let child = Command::new(nanoclawd_binary())
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .env("RUST_LOG", "warn")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn nanoclawd");
        TestDaemon { child }
    }

    fn interrupt_and_wait(mut self) -> std::process::ExitStatus {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGINT);
        }
        let deadline = Instant::now() + Duration::from_secs(40);
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("nanoclawd did not exit after SIGINT");
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_for(path: &std::path::Path, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !path.exists() {
        assert!(
            Instant::now() < deadline,
            "{what} not created within 15s: {}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn print_config_emits_documented_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_test_config(&dir);

    let output = Command::new(nanoclawd_binary())
        .args(["print-config", "--config", config.to_str().unwrap()])
        .output()
        .expect("run print-config");
    assert!(output.status.success());

    let body: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(body["queue"]["max_concurrent"], 5);
    assert_eq!(body["queue"]["base_retry_ms"], 5000);
    assert_eq!(body["queue"]["max_retries"], 5);
    assert_eq!(body["orchestrator"]["poll_interval_ms"], 200);
    assert_eq!(body["orchestrator"]["max_context_messages"], 100);
    assert_eq!(body["orchestrator"]["main_folder"], "main");
    assert_eq!(body["scheduler"]["timezone"], "UTC");
    assert_eq!(body["channels"]["telegram"]["enabled"], false);
}

#[test]
fn serve_initializes_store_and_ipc_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_test_config(&dir);

    // Seed a registered group and one unprocessed message so startup
    // recovery has something to chew on (the sandbox spawn then fails
    // harmlessly without Docker).
    let db_path = dir.path().join("store/nanoclaw.db");
    {
        let store = Store::open(&db_path).unwrap();
        store
            .upsert_registered_group(&RegisteredGroup {
                chat_id: "tg:100".into(),
                name: "Main".into(),
                folder: "main".into(),
                trigger_pattern: String::new(),
                added_at: now_rfc3339(),
                container_config: None,
                requires_trigger: false,
            })
            .unwrap();
        store
            .store_message(&Message {
                id: "m1".into(),
                chat_id: "tg:100".into(),
                channel: "telegram".into(),
                sender_id: "u1".into(),
                sender_name: "Alice".into(),
                content: "@Andy hi".into(),
                timestamp: now_rfc3339(),
                is_from_me: false,
            })
            .unwrap();
    }

    let daemon = TestDaemon::start(&config);

    // The registered group's IPC namespace and the quarantine dir appear
    // at startup.
    let ipc_root = dir.path().join("data/ipc");
    wait_for(&ipc_root.join("errors"), "IPC errors dir");
    wait_for(&ipc_root.join("main/input"), "main input dir");
    wait_for(&ipc_root.join("main/messages"), "main messages dir");
    wait_for(&ipc_root.join("main/tasks"), "main tasks dir");

    // Let the daemon reach its signal handler before interrupting.
    std::thread::sleep(Duration::from_millis(700));
    let status = daemon.interrupt_and_wait();
    assert!(status.success(), "daemon exited non-zero: {status:?}");
}

#[test]
fn serve_shuts_down_cleanly_with_empty_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_test_config(&dir);

    let daemon = TestDaemon::start(&config);
    wait_for(&dir.path().join("store/nanoclaw.db"), "store file");
    // Give the loops one tick before interrupting.
    std::thread::sleep(Duration::from_millis(500));

    let status = daemon.interrupt_and_wait();
    assert!(status.success(), "daemon exited non-zero: {status:?}");
}
