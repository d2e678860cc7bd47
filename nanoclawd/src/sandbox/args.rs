//! Launch arguments, environment filtering, and secret loading.
//!
//! The sandbox environment is computed from an allow-list of variable
//! names. Secrets are read from the project `.env` file and travel only on
//! stdin, never through the environment or the command line.

use std::collections::HashMap;
use std::path::Path;

use nanoclaw_core::VolumeMount;
use nanoclaw_core::config::SandboxConfig;
use tracing::debug;

/// Secret keys forwarded to the agent over stdin.
const SECRET_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"];

/// Host environment variables the sandbox is allowed to inherit.
const ENV_ALLOWLIST: &[&str] = &["LANG", "LC_ALL", "TERM"];

/// Parse a `.env` file, returning values for the requested keys only.
fn read_env_file(env_path: &Path, keys: &[&str]) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %env_path.display(), ".env file not found");
            return HashMap::new();
        }
    };

    let wanted: std::collections::HashSet<&str> = keys.iter().copied().collect();
    let mut result = HashMap::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(eq_idx) = trimmed.find('=') else {
            continue;
        };
        let key = trimmed[..eq_idx].trim();
        if !wanted.contains(key) {
            continue;
        }
        let mut value = trimmed[eq_idx + 1..].trim().to_string();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }
        if !value.is_empty() {
            result.insert(key.to_string(), value);
        }
    }

    result
}

/// Read the agent's secrets from the project `.env`.
pub fn read_secrets(project_root: &Path) -> HashMap<String, String> {
    read_env_file(&project_root.join(".env"), SECRET_KEYS)
}

/// Environment passed to the sandbox: the allow-listed host variables plus
/// the run's timezone. Nothing else leaks in.
pub fn effective_env(timezone: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = ENV_ALLOWLIST
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();
    env.push(("TZ".to_string(), timezone.to_string()));
    env
}

/// Build the container CLI arguments for one sandbox launch, hardening
/// defaults included: no network, all capabilities dropped, no privilege
/// escalation, read-only root with a tmpfs scratch area, bounded memory,
/// CPU, and PIDs.
pub fn build_container_args(
    mounts: &[VolumeMount],
    container_name: &str,
    config: &SandboxConfig,
    timezone: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        "/tmp:rw,size=64m,mode=1777".to_string(),
        "--memory".to_string(),
        config.memory.clone(),
        "--cpus".to_string(),
        config.cpus.clone(),
        "--pids-limit".to_string(),
        config.pids_limit.to_string(),
    ];

    for (key, value) in effective_env(timezone) {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    // Run as the host user so bind-mounted files stay accessible.
    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        if uid != 0 {
            args.push("--user".to_string());
            args.push(format!("{uid}:{gid}"));
        }
    }

    for mount in mounts {
        args.push("-v".to_string());
        if mount.readonly {
            args.push(format!("{}:{}:ro", mount.host_path, mount.container_path));
        } else {
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }
    }

    args.push(config.image.clone());
    args
}
