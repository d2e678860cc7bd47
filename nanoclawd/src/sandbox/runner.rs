//! Sandbox runner: spawns one container per run, writes the stdin payload,
//! streams marker-framed stdout records, and enforces both timeouts.
//!
//! Timeout model:
//! - hard timeout: total runtime bound, per-group override allowed. Expiry
//!   is a run failure.
//! - idle timeout: armed after the first emitted output; piped IPC input
//!   resets it (the queue holds the activity handle). Expiry is a normal
//!   wind-down, not a failure.
//!
//! Anything between a marker pair that is not valid JSON fails the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nanoclaw_core::Error;
use nanoclaw_core::config::SandboxConfig;
use nanoclaw_core::ipc::IpcPaths;
use nanoclaw_core::sandbox::{
    SandboxInput, SandboxOutput, SandboxStatus, extract_framed_records, strip_internal_spans,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::args::{build_container_args, read_secrets};
use super::mounts::{GroupInfo, build_volume_mounts, container_name};
use super::security::MountAllowlist;

const CONTAINER_RUNTIME_BIN: &str = "docker";

/// Captured stdout/stderr bound (1 MiB) before truncation.
const MAX_CAPTURE_SIZE: usize = 1_048_576;

/// Everything a run needs beyond the group itself.
#[derive(Clone)]
pub struct RunConfig {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub ipc: IpcPaths,
    pub sandbox: SandboxConfig,
    pub timezone: String,
    pub allowlist: Option<MountAllowlist>,
}

/// Result of one sandbox run.
pub struct RunResult {
    pub output: SandboxOutput,
    pub container_name: String,
    pub duration: Duration,
    pub had_output: bool,
}

/// Invoked for every framed record, after `<internal>` spans are stripped
/// from non-null success results.
pub type OutputCallback = Box<dyn Fn(SandboxOutput) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once after spawn with the container name and the activity handle
/// the idle watchdog listens on.
pub type SpawnHook =
    Box<dyn FnOnce(String, watch::Sender<Instant>) -> BoxFuture<'static, ()> + Send>;

/// Run one sandbox to completion.
pub async fn run_sandbox(
    group: &GroupInfo,
    input: &SandboxInput,
    is_main: bool,
    config: &RunConfig,
    on_output: Option<Arc<OutputCallback>>,
    on_spawn: Option<SpawnHook>,
) -> anyhow::Result<RunResult> {
    let start = Instant::now();

    let name = container_name(&group.folder)
        .ok_or_else(|| anyhow::anyhow!("folder {:?} yields an empty container name", group.folder))?;

    let group_dir = config.groups_dir.join(&group.folder);
    let logs_dir = group_dir.join("logs");
    tokio::fs::create_dir_all(&logs_dir).await.ok();

    let mounts = build_volume_mounts(
        group,
        is_main,
        &config.project_root,
        &config.groups_dir,
        &config.ipc,
        config.allowlist.as_ref(),
    );
    let container_args = build_container_args(&mounts, &name, &config.sandbox, &config.timezone);

    info!(
        folder = group.folder.as_str(),
        container = name.as_str(),
        mounts = mounts.len(),
        is_main,
        "spawning sandbox"
    );

    let mut child = Command::new(CONTAINER_RUNTIME_BIN)
        .args(&container_args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn sandbox: {e}"))?;

    // Stdin carries the single JSON payload, secrets included, then closes.
    {
        let mut stdin_input = input.clone();
        let secrets = read_secrets(&config.project_root);
        if !secrets.is_empty() {
            stdin_input.secrets = Some(secrets);
        }
        let payload = serde_json::to_string(&stdin_input)?;
        drop(stdin_input);

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await.ok();
        }
    }

    let (activity_tx, activity_rx) = watch::channel(Instant::now());

    if let Some(hook) = on_spawn {
        hook(name.clone(), activity_tx.clone()).await;
    }

    let hard_timeout = Duration::from_millis(
        group
            .container_config
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .unwrap_or(config.sandbox.container_timeout_ms),
    );
    let idle_timeout = Duration::from_millis(config.sandbox.idle_timeout_ms);

    let had_output = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    let idle_stopped = Arc::new(AtomicBool::new(false));

    let watchdog = tokio::spawn(watchdog_loop(
        name.clone(),
        start,
        hard_timeout,
        idle_timeout,
        activity_rx,
        had_output.clone(),
        timed_out.clone(),
        idle_stopped.clone(),
    ));

    // Stream stdout for framed records, capture stderr alongside.
    let stdout = child.stdout.take().expect("stdout piped");
    let mut stdout_reader = BufReader::new(stdout);
    let mut stdout_pending = String::new();
    let mut stdout_total = String::new();
    let mut stdout_truncated = false;
    let mut stdout_line = String::new();
    let mut stdout_eof = false;

    let stderr = child.stderr.take().expect("stderr piped");
    let mut stderr_reader = BufReader::new(stderr);
    let mut stderr_total = String::new();
    let mut stderr_truncated = false;
    let mut stderr_line = String::new();
    let mut stderr_eof = false;

    // The first session id a run announces is the one that sticks; later
    // records may carry stale or retried ids.
    let mut first_session_id: Option<String> = None;
    let mut saw_error_record = false;
    let mut output_fault: Option<String> = None;

    while !stdout_eof {
        tokio::select! {
            read = stdout_reader.read_line(&mut stdout_line) => {
                match read {
                    Ok(0) => stdout_eof = true,
                    Ok(_) => {
                        append_capped(&mut stdout_total, &stdout_line, &mut stdout_truncated);
                        stdout_pending.push_str(&stdout_line);
                        stdout_line.clear();

                        let (records, consumed) = extract_framed_records(&stdout_pending);
                        if consumed > 0 {
                            stdout_pending = stdout_pending[consumed..].to_string();
                        }
                        // Markers sit on their own lines, so a buffer with no
                        // start marker holds only noise.
                        if !stdout_pending.contains(nanoclaw_core::OUTPUT_START_MARKER) {
                            stdout_pending.clear();
                        }
                        for raw in records {
                            match serde_json::from_str::<SandboxOutput>(&raw) {
                                Ok(mut record) => {
                                    if first_session_id.is_none() {
                                        if let Some(sid) = &record.new_session_id {
                                            first_session_id = Some(sid.clone());
                                        }
                                    }
                                    if record.status == SandboxStatus::Error {
                                        saw_error_record = true;
                                    }
                                    if record.status == SandboxStatus::Success {
                                        if let Some(text) = &record.result {
                                            record.result = Some(strip_internal_spans(text));
                                        }
                                    }
                                    had_output.store(true, Ordering::SeqCst);
                                    let _ = activity_tx.send(Instant::now());
                                    if let Some(cb) = &on_output {
                                        cb(record).await;
                                    }
                                }
                                Err(e) => {
                                    // Garbage between markers is unrecoverable.
                                    error!(
                                        folder = group.folder.as_str(),
                                        err = %e,
                                        "unparseable framed record, failing run"
                                    );
                                    output_fault = Some(format!("unparseable framed record: {e}"));
                                    let _ = Command::new(CONTAINER_RUNTIME_BIN)
                                        .args(["kill", &name])
                                        .output()
                                        .await;
                                    stdout_eof = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(folder = group.folder.as_str(), err = %e, "error reading sandbox stdout");
                        stdout_eof = true;
                    }
                }
            }
            read = stderr_reader.read_line(&mut stderr_line), if !stderr_eof => {
                match read {
                    Ok(0) => stderr_eof = true,
                    Ok(_) => {
                        let line = stderr_line.trim();
                        if !line.is_empty() {
                            debug!(folder = group.folder.as_str(), "{line}");
                        }
                        append_capped(&mut stderr_total, &stderr_line, &mut stderr_truncated);
                        stderr_line.clear();
                    }
                    Err(_) => stderr_eof = true,
                }
            }
        }
    }

    let status = child.wait().await?;
    let duration = start.elapsed();
    watchdog.abort();

    let was_hard_timeout = timed_out.load(Ordering::SeqCst);
    let was_idle_stop = idle_stopped.load(Ordering::SeqCst);
    let emitted = had_output.load(Ordering::SeqCst);
    let exit_code = status.code();

    write_run_log(
        &logs_dir,
        &group.folder,
        &name,
        duration,
        exit_code,
        was_hard_timeout,
        emitted,
        &mounts,
        &stdout_total,
        stdout_truncated,
        &stderr_total,
        stderr_truncated,
    )
    .await;

    let output = if let Some(fault) = output_fault {
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(Error::SandboxOutput(fault).to_string()),
        }
    } else if was_hard_timeout {
        error!(
            folder = group.folder.as_str(),
            duration_ms = duration.as_millis() as u64,
            "sandbox hit hard timeout"
        );
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(
                Error::SandboxTimeout {
                    elapsed_ms: hard_timeout.as_millis() as u64,
                }
                .to_string(),
            ),
        }
    } else if was_idle_stop {
        info!(
            folder = group.folder.as_str(),
            duration_ms = duration.as_millis() as u64,
            "sandbox wound down after idle timeout"
        );
        SandboxOutput {
            status: SandboxStatus::Success,
            result: None,
            new_session_id: first_session_id.clone(),
            error: None,
        }
    } else if !status.success() {
        error!(
            folder = group.folder.as_str(),
            exit_code = ?exit_code,
            "sandbox exited with error"
        );
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(
                Error::SandboxExit {
                    code: exit_code,
                    detail: tail_chars(&stderr_total, 200).to_string(),
                }
                .to_string(),
            ),
        }
    } else if saw_error_record {
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            new_session_id: first_session_id.clone(),
            error: Some("sandbox reported a structured error".to_string()),
        }
    } else if emitted {
        SandboxOutput {
            status: SandboxStatus::Success,
            result: None,
            new_session_id: first_session_id.clone(),
            error: None,
        }
    } else {
        SandboxOutput {
            status: SandboxStatus::Error,
            result: None,
            new_session_id: None,
            error: Some("sandbox exited without emitting any framed output".to_string()),
        }
    };

    Ok(RunResult {
        output,
        container_name: name,
        duration,
        had_output: emitted,
    })
}

/// Hard/idle timeout watchdog. The idle countdown arms only after the first
/// emitted output; piped IPC input resets it through the activity channel.
#[allow(clippy::too_many_arguments)]
async fn watchdog_loop(
    container: String,
    start: Instant,
    hard_timeout: Duration,
    idle_timeout: Duration,
    mut activity_rx: watch::Receiver<Instant>,
    had_output: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    idle_stopped: Arc<AtomicBool>,
) {
    let hard_deadline = start + hard_timeout;

    loop {
        let now = Instant::now();
        if now >= hard_deadline {
            timed_out.store(true, Ordering::SeqCst);
            error!(container = container.as_str(), "hard timeout, stopping sandbox");
            let _ = Command::new(CONTAINER_RUNTIME_BIN)
                .args(["stop", &container])
                .output()
                .await;
            return;
        }

        let mut wake = hard_deadline;
        if had_output.load(Ordering::SeqCst) {
            let idle_deadline = *activity_rx.borrow() + idle_timeout;
            if now >= idle_deadline {
                idle_stopped.store(true, Ordering::SeqCst);
                info!(container = container.as_str(), "idle timeout, stopping sandbox");
                let _ = Command::new(CONTAINER_RUNTIME_BIN)
                    .args(["stop", &container])
                    .output()
                    .await;
                return;
            }
            wake = wake.min(idle_deadline);
        } else {
            // Re-check once a second until the first output arms the idle timer.
            wake = wake.min(now + Duration::from_secs(1));
        }

        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            _ = activity_rx.changed() => {}
        }
    }
}

/// Last `n` characters of a string, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    s.char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| &s[i..])
        .unwrap_or(s)
}

fn append_capped(total: &mut String, line: &str, truncated: &mut bool) {
    if *truncated {
        return;
    }
    let remaining = MAX_CAPTURE_SIZE - total.len();
    if line.len() > remaining {
        let mut cut = remaining;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        total.push_str(&line[..cut]);
        *truncated = true;
    } else {
        total.push_str(line);
    }
}

/// Write a per-run log under `groups/<folder>/logs/`. Error runs keep the
/// captured streams for debugging; clean runs log only the mount shape.
#[allow(clippy::too_many_arguments)]
async fn write_run_log(
    logs_dir: &Path,
    folder: &str,
    container: &str,
    duration: Duration,
    exit_code: Option<i32>,
    timed_out: bool,
    had_output: bool,
    mounts: &[nanoclaw_core::VolumeMount],
    stdout: &str,
    stdout_truncated: bool,
    stderr: &str,
    stderr_truncated: bool,
) {
    let stamp = nanoclaw_core::now_rfc3339().replace(':', "-");
    let log_file = logs_dir.join(format!("run-{stamp}.log"));
    let is_error = exit_code.unwrap_or(0) != 0 || timed_out;

    let mut lines = vec![
        format!("=== Sandbox Run{} ===", if timed_out { " (TIMEOUT)" } else { "" }),
        format!("Folder: {folder}"),
        format!("Container: {container}"),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit code: {exit_code:?}"),
        format!("Had output: {had_output}"),
        String::new(),
        "=== Mounts ===".to_string(),
    ];
    for m in mounts {
        lines.push(format!(
            "{} -> {}{}",
            m.host_path,
            m.container_path,
            if m.readonly { " (ro)" } else { "" }
        ));
    }

    if is_error {
        lines.push(String::new());
        lines.push(format!(
            "=== Stderr{} ===",
            if stderr_truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stderr.to_string());
        lines.push(String::new());
        lines.push(format!(
            "=== Stdout{} ===",
            if stdout_truncated { " (TRUNCATED)" } else { "" }
        ));
        lines.push(stdout.to_string());
    }

    if let Err(e) = tokio::fs::write(&log_file, lines.join("\n")).await {
        warn!(log_file = %log_file.display(), err = %e, "failed to write run log");
    }
}

/// Check that the container runtime answers.
pub async fn ensure_runtime_available() -> anyhow::Result<()> {
    let output = Command::new(CONTAINER_RUNTIME_BIN)
        .args(["info"])
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("container runtime not found: {e}"))?;

    if !output.status.success() {
        anyhow::bail!("container runtime is not running");
    }
    debug!("container runtime available");
    Ok(())
}

/// Stop orphaned nanoclaw containers left over from a previous process.
pub async fn cleanup_orphans() {
    let output = match Command::new(CONTAINER_RUNTIME_BIN)
        .args(["ps", "--filter", "name=nanoclaw-", "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(err = %e, "failed to list orphaned sandboxes");
            return;
        }
    };

    let names: Vec<&str> = std::str::from_utf8(&output.stdout)
        .unwrap_or("")
        .trim()
        .split('\n')
        .filter(|s| !s.is_empty())
        .collect();

    for name in &names {
        let _ = Command::new(CONTAINER_RUNTIME_BIN)
            .args(["stop", name])
            .output()
            .await;
    }

    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned sandboxes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_capped_truncates_once() {
        let mut total = String::new();
        let mut truncated = false;
        append_capped(&mut total, "short\n", &mut truncated);
        assert!(!truncated);
        assert_eq!(total, "short\n");

        let mut total = "x".repeat(MAX_CAPTURE_SIZE - 3);
        append_capped(&mut total, "abcdef", &mut truncated);
        assert!(truncated);
        assert_eq!(total.len(), MAX_CAPTURE_SIZE);

        // Further appends are dropped.
        append_capped(&mut total, "more", &mut truncated);
        assert_eq!(total.len(), MAX_CAPTURE_SIZE);
    }

    #[tokio::test]
    async fn run_log_includes_streams_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_run_log(
            tmp.path(),
            "team-eng",
            "nanoclaw-team-eng-1",
            Duration::from_millis(1500),
            Some(1),
            false,
            false,
            &[],
            "stdout capture",
            false,
            "stderr capture",
            false,
        )
        .await;

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        assert!(content.contains("stderr capture"));
        assert!(content.contains("stdout capture"));
        assert!(content.contains("Exit code: Some(1)"));
    }

    #[tokio::test]
    async fn run_log_omits_streams_on_success() {
        let tmp = tempfile::tempdir().unwrap();
        write_run_log(
            tmp.path(),
            "main",
            "nanoclaw-main-1",
            Duration::from_millis(900),
            Some(0),
            false,
            true,
            &[],
            "stdout capture",
            false,
            "stderr capture",
            false,
        )
        .await;

        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().flatten().collect();
        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        assert!(!content.contains("stderr capture"));
    }
}
