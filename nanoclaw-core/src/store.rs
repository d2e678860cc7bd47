//! Embedded persistence store.
//!
//! Single SQLite database in WAL mode, schema ensured on open. Writes are
//! serialized behind a connection mutex; every operation is a short
//! transaction. Storage failures surface as [`Error::Storage`] and are fatal
//! to the daemon.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub channel: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// RFC3339; lexicographic order is chronological order.
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub chat_id: String,
    pub name: String,
    pub channel: String,
    pub last_message_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub chat_id: String,
    pub name: String,
    /// Filesystem-safe identity; doubles as the IPC authorization principal.
    pub folder: String,
    pub trigger_pattern: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    pub requires_trigger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(ScheduleKind::Cron),
            "interval" => Some(ScheduleKind::Interval),
            "once" => Some(ScheduleKind::Once),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "group" => ContextMode::Group,
            _ => ContextMode::Isolated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub folder: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    /// "success" or "error".
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Current time formatted so that string comparison preserves ordering.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create store dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        debug!("store schema ensured");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn store_message(&self, msg: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, channel, sender_id, sender_name, content, timestamp, is_from_me)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (id, chat_id) DO UPDATE SET content = excluded.content",
                params![
                    msg.id,
                    msg.chat_id,
                    msg.channel,
                    msg.sender_id,
                    msg.sender_name,
                    msg.content,
                    msg.timestamp,
                    msg.is_from_me,
                ],
            )?;
            Ok(())
        })
    }

    /// Messages strictly newer than `cursor` across all registered chats,
    /// oldest first.
    pub fn messages_after(&self, cursor: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, channel, sender_id, sender_name, content, timestamp, is_from_me
                 FROM messages
                 WHERE timestamp > ?1
                   AND chat_id IN (SELECT chat_id FROM registered_groups)
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![cursor], row_to_message)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    /// A chat's missed window: messages strictly newer than `cursor`.
    pub fn messages_since(&self, chat_id: &str, cursor: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, channel, sender_id, sender_name, content, timestamp, is_from_me
                 FROM messages
                 WHERE chat_id = ?1 AND timestamp > ?2
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![chat_id, cursor], row_to_message)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    /// Timestamp of a chat's newest message, if any.
    pub fn latest_message_time(&self, chat_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT MAX(timestamp) FROM messages WHERE chat_id = ?1",
                    params![chat_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten())
        })
    }

    // -----------------------------------------------------------------------
    // Chat metadata
    // -----------------------------------------------------------------------

    /// Upsert chat metadata, keeping the greater `last_message_time`.
    pub fn upsert_chat_metadata(
        &self,
        chat_id: &str,
        name: &str,
        channel: &str,
        timestamp: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (chat_id, name, channel, last_message_time)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chat_id) DO UPDATE SET
                   name = excluded.name,
                   channel = excluded.channel,
                   last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
                params![chat_id, name, channel, timestamp],
            )?;
            Ok(())
        })
    }

    pub fn get_all_chats(&self) -> Result<Vec<ChatMetadata>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, name, channel, last_message_time
                 FROM chats ORDER BY last_message_time DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ChatMetadata {
                    chat_id: row.get(0)?,
                    name: row.get(1)?,
                    channel: row.get(2)?,
                    last_message_time: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    // -----------------------------------------------------------------------
    // Router state
    // -----------------------------------------------------------------------

    pub fn get_router_state(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM router_state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO router_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn get_session(&self, folder: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE folder = ?1",
                    params![folder],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (folder, session_id) VALUES (?1, ?2)
                 ON CONFLICT (folder) DO UPDATE SET session_id = excluded.session_id",
                params![folder, session_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_session(&self, folder: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE folder = ?1", params![folder])?;
            Ok(())
        })
    }

    pub fn get_all_sessions(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT folder, session_id FROM sessions")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<std::result::Result<HashMap<_, _>, _>>()?)
        })
    }

    // -----------------------------------------------------------------------
    // Registered groups
    // -----------------------------------------------------------------------

    pub fn upsert_registered_group(&self, group: &RegisteredGroup) -> Result<()> {
        let config_json = group
            .container_config
            .as_ref()
            .map(|v| v.to_string());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO registered_groups
                   (chat_id, name, folder, trigger_pattern, added_at, container_config, requires_trigger)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (chat_id) DO UPDATE SET
                   name = excluded.name,
                   folder = excluded.folder,
                   trigger_pattern = excluded.trigger_pattern,
                   container_config = excluded.container_config,
                   requires_trigger = excluded.requires_trigger",
                params![
                    group.chat_id,
                    group.name,
                    group.folder,
                    group.trigger_pattern,
                    group.added_at,
                    config_json,
                    group.requires_trigger,
                ],
            )?;
            Ok(())
        })
    }

    /// All registered groups indexed by chat id.
    pub fn get_registered_groups(&self) -> Result<HashMap<String, RegisteredGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, name, folder, trigger_pattern, added_at, container_config, requires_trigger
                 FROM registered_groups",
            )?;
            let rows = stmt.query_map([], row_to_group)?;
            let mut map = HashMap::new();
            for row in rows {
                let group = row?;
                map.insert(group.chat_id.clone(), group);
            }
            Ok(map)
        })
    }

    pub fn get_group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT chat_id, name, folder, trigger_pattern, added_at, container_config, requires_trigger
                     FROM registered_groups WHERE folder = ?1",
                    params![folder],
                    row_to_group,
                )
                .optional()?)
        })
    }

    // -----------------------------------------------------------------------
    // Scheduled tasks
    // -----------------------------------------------------------------------

    pub fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                   (id, folder, chat_id, prompt, schedule_kind, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id,
                    task.folder,
                    task.chat_id,
                    task.prompt,
                    task.schedule_kind.as_str(),
                    task.schedule_value,
                    task.context_mode.as_str(),
                    task.next_run,
                    task.last_run,
                    task.last_result,
                    task.status.as_str(),
                    task.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{TASK_COLUMNS} WHERE id = ?1"),
                    params![id],
                    row_to_task,
                )
                .optional()?)
        })
    }

    /// Active tasks due at or before `now`, ordered by `(next_run, id)`.
    pub fn due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_COLUMNS}
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![now], row_to_task)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn tasks_for_folder(&self, folder: &str) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_COLUMNS} WHERE folder = ?1 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![folder], row_to_task)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_task_next_run(&self, id: &str, next_run: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
                params![id, next_run],
            )?;
            Ok(())
        })
    }

    /// Post-run bookkeeping: advance `next_run` (completing one-shots),
    /// stamp `last_run` and `last_result`.
    pub fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let now = now_rfc3339();
            conn.execute(
                "UPDATE scheduled_tasks SET
                   next_run = ?2,
                   last_run = ?3,
                   last_result = ?4,
                   status = CASE WHEN ?2 IS NULL AND status = 'active' THEN 'completed' ELSE status END
                 WHERE id = ?1",
                params![id, next_run, now, last_result],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Task run logs
    // -----------------------------------------------------------------------

    pub fn append_task_run_log(&self, log: &TaskRunLog) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.task_id,
                    log.run_at,
                    log.duration_ms,
                    log.status,
                    log.result,
                    log.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn task_run_logs(&self, task_id: &str) -> Result<Vec<TaskRunLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, run_at, duration_ms, status, result, error
                 FROM task_run_logs WHERE task_id = ?1 ORDER BY run_at ASC",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                Ok(TaskRunLog {
                    task_id: row.get(0)?,
                    run_at: row.get(1)?,
                    duration_ms: row.get(2)?,
                    status: row.get(3)?,
                    result: row.get(4)?,
                    error: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }
}

// ---------------------------------------------------------------------------
// Schema + row mapping
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "SELECT id, folder, chat_id, prompt, schedule_kind, schedule_value,
    context_mode, next_run, last_run, last_result, status, created_at FROM scheduled_tasks";

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "\
        CREATE TABLE IF NOT EXISTS chats (
          chat_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          channel TEXT NOT NULL,
          last_message_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT NOT NULL,
          chat_id TEXT NOT NULL,
          channel TEXT NOT NULL,
          sender_id TEXT,
          sender_name TEXT,
          content TEXT,
          timestamp TEXT NOT NULL,
          is_from_me INTEGER DEFAULT 0,
          PRIMARY KEY (id, chat_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_id, timestamp);

        CREATE TABLE IF NOT EXISTS registered_groups (
          chat_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL UNIQUE,
          trigger_pattern TEXT NOT NULL DEFAULT '',
          added_at TEXT NOT NULL,
          container_config TEXT,
          requires_trigger INTEGER DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS sessions (
          folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS router_state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          folder TEXT NOT NULL,
          chat_id TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_kind TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL,
          run_at TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          result TEXT,
          error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at);
        ",
    )
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        channel: row.get(2)?,
        sender_id: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        sender_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        content: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        timestamp: row.get(6)?,
        is_from_me: row.get(7)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    let config_json: Option<String> = row.get(5)?;
    Ok(RegisteredGroup {
        chat_id: row.get(0)?,
        name: row.get(1)?,
        folder: row.get(2)?,
        trigger_pattern: row.get(3)?,
        added_at: row.get(4)?,
        container_config: config_json.and_then(|s| serde_json::from_str(&s).ok()),
        requires_trigger: row.get(6)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let kind: String = row.get(4)?;
    let mode: String = row.get(6)?;
    let status: String = row.get(10)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        folder: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        schedule_kind: ScheduleKind::parse(&kind).unwrap_or(ScheduleKind::Once),
        schedule_value: row.get(5)?,
        context_mode: ContextMode::parse(&mode),
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Cancelled),
        created_at: row.get(11)?,
    })
}
