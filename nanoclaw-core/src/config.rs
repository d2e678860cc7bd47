use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NanoclawConfig {
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub queue: QueueConfig,
    pub sandbox: SandboxConfig,
    pub ipc: IpcConfig,
    pub scheduler: SchedulerConfig,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the embedded SQLite database.
    pub db_path: String,
    /// Root for IPC namespaces and per-group session state.
    pub data_dir: String,
    /// Root for per-group working directories.
    pub groups_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "store/nanoclaw.db".to_string(),
            data_dir: "data".to_string(),
            groups_dir: "groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Message-loop cadence (milliseconds).
    pub poll_interval_ms: u64,
    /// Assistant name; `@{name}` at the start of a message is the default trigger.
    pub assistant_name: String,
    /// Folder with elevated rights (register_group, refresh_groups, cross-folder tasks).
    pub main_folder: String,
    /// Context truncation bound for a single agent prompt.
    pub max_context_messages: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            assistant_name: "Andy".to_string(),
            main_folder: "main".to_string(),
            max_context_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global cap on simultaneously live sandboxes.
    pub max_concurrent: usize,
    /// First retry delay; doubled per attempt.
    pub base_retry_ms: u64,
    /// Retries before a folder is parked until the next enqueue.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            base_retry_ms: 5000,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image for agent sandboxes.
    pub image: String,
    /// Hard run limit (milliseconds).
    pub container_timeout_ms: u64,
    /// Idle-waiting limit after the last output (milliseconds).
    pub idle_timeout_ms: u64,
    /// Memory limit passed to the runtime (e.g. "2g").
    pub memory: String,
    /// CPU limit passed to the runtime (e.g. "2").
    pub cpus: String,
    /// PID limit inside the sandbox.
    pub pids_limit: u32,
    /// External mount allowlist; additional mounts are blocked when unset.
    pub mount_allowlist_path: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "nanoclaw-agent:latest".to_string(),
            container_timeout_ms: 1_800_000,
            idle_timeout_ms: 300_000,
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            pids_limit: 256,
            mount_allowlist_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Host-side watcher cadence over `messages/` and `tasks/` (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Due-task poll cadence (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron evaluation.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Long-poll timeout passed to getUpdates (seconds).
    pub poll_timeout_secs: u64,
    /// Chat ids allowed to produce inbound events; empty allows none.
    pub allowed_chats: Vec<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_timeout_secs: 30,
            allowed_chats: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    /// Channel ids to poll for new messages.
    pub channel_ids: Vec<String>,
    pub poll_interval_ms: u64,
    pub allowed_chats: Vec<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_ids: Vec::new(),
            poll_interval_ms: 2000,
            allowed_chats: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    /// Webhook bind address.
    pub bind: String,
    /// Cloud API phone number id used for outbound sends.
    pub phone_number_id: String,
    /// Token echoed back during webhook verification.
    pub verify_token: String,
    pub allowed_chats: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8443".to_string(),
            phone_number_id: String::new(),
            verify_token: String::new(),
            allowed_chats: Vec::new(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<NanoclawConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(NanoclawConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: NanoclawConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl NanoclawConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("ASSISTANT_NAME") {
            if !name.trim().is_empty() {
                self.orchestrator.assistant_name = name;
            }
        }

        if let Ok(db) = std::env::var("NANOCLAW_DB_PATH") {
            if !db.trim().is_empty() {
                self.storage.db_path = db;
            }
        }

        if let Ok(tz) = std::env::var("NANOCLAW_TIMEZONE") {
            if !tz.trim().is_empty() {
                self.scheduler.timezone = tz;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NanoclawConfig::default();
        assert_eq!(cfg.queue.max_concurrent, 5);
        assert_eq!(cfg.queue.base_retry_ms, 5000);
        assert_eq!(cfg.queue.max_retries, 5);
        assert_eq!(cfg.sandbox.container_timeout_ms, 1_800_000);
        assert_eq!(cfg.orchestrator.poll_interval_ms, 2000);
        assert_eq!(cfg.orchestrator.max_context_messages, 100);
        assert_eq!(cfg.orchestrator.main_folder, "main");
        assert_eq!(cfg.scheduler.poll_interval_ms, 60_000);
        assert_eq!(cfg.scheduler.timezone, "UTC");
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: NanoclawConfig = toml::from_str(
            r#"
            [queue]
            max_concurrent = 2

            [channels.telegram]
            enabled = true
            allowed_chats = ["tg:123"]
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.queue.max_concurrent, 2);
        assert_eq!(parsed.queue.base_retry_ms, 5000);
        assert!(parsed.channels.telegram.enabled);
        assert_eq!(parsed.channels.telegram.allowed_chats, vec!["tg:123"]);
        assert!(!parsed.channels.discord.enabled);
    }

    #[test]
    fn unknown_config_path_yields_defaults() {
        let cfg = load_config("/nonexistent/nanoclaw.toml").expect("load defaults");
        assert_eq!(cfg.sandbox.image, "nanoclaw-agent:latest");
    }
}
