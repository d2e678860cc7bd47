//! Filesystem IPC frames shared between sandboxes and the host.
//!
//! Per-folder tree under the data root:
//!
//! ```text
//! ipc/<folder>/input/       host → sandbox (follow-up prompts, _close)
//! ipc/<folder>/messages/    sandbox → host (outbound chat messages)
//! ipc/<folder>/tasks/       sandbox → host (task + group-admin commands)
//! ipc/errors/               quarantine for malformed/unauthorized files
//! ```
//!
//! A frame is complete iff it was renamed into place from a sibling temp
//! path. Readers claim files by renaming them away before parsing, so a
//! crash mid-processing never double-delivers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::{ContextMode, ScheduleKind};

/// Zero-byte file name signalling a sandbox to exit its IPC loop.
pub const CLOSE_SENTINEL: &str = "_close";

/// Host → sandbox frame written into `input/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputFrame {
    Message { text: String },
}

/// Sandbox → host frame read from `messages/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    SendMessage {
        target_chat_id: String,
        text: String,
    },
}

/// Sandbox → host command read from `tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskCommand {
    ScheduleTask {
        prompt: String,
        schedule_kind: ScheduleKind,
        schedule_value: String,
        #[serde(default)]
        target_chat_id: Option<String>,
        #[serde(default)]
        target_folder: Option<String>,
        #[serde(default)]
        context_mode: ContextMode,
    },
    PauseTask {
        task_id: String,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    RefreshGroups,
    RegisterGroup {
        chat_id: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger_pattern: Option<String>,
        #[serde(default)]
        requires_trigger: Option<bool>,
    },
}

/// Authorization context derived from the directory a file was read from.
/// The source folder IS the identity; nothing inside the file overrides it.
#[derive(Debug, Clone)]
pub struct FolderContext {
    pub folder: String,
    pub is_main: bool,
}

impl FolderContext {
    pub fn new(folder: impl Into<String>, main_folder: &str) -> Self {
        let folder = folder.into();
        let is_main = folder == main_folder;
        Self { folder, is_main }
    }
}

/// Resolves the per-folder IPC directory layout under a data root.
#[derive(Debug, Clone)]
pub struct IpcPaths {
    root: PathBuf,
}

impl IpcPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("ipc"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_dir(&self, folder: &str) -> PathBuf {
        self.root.join(folder)
    }

    pub fn input_dir(&self, folder: &str) -> PathBuf {
        self.folder_dir(folder).join("input")
    }

    pub fn messages_dir(&self, folder: &str) -> PathBuf {
        self.folder_dir(folder).join("messages")
    }

    pub fn tasks_dir(&self, folder: &str) -> PathBuf {
        self.folder_dir(folder).join("tasks")
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.root.join("errors")
    }

    /// Create the full namespace for a folder.
    pub fn ensure_folder(&self, folder: &str) -> io::Result<()> {
        for sub in ["input", "messages", "tasks"] {
            fs::create_dir_all(self.folder_dir(folder).join(sub))?;
        }
        fs::create_dir_all(self.errors_dir())
    }
}

/// Folder names double as authorization principals; keep them filesystem-safe.
pub fn is_valid_folder(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Frame file names look like `<unix-ms>-<random>.json`.
pub fn is_frame_file_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".json") else {
        return false;
    };
    let Some((ms, rand)) = stem.split_once('-') else {
        return false;
    };
    !ms.is_empty()
        && ms.bytes().all(|b| b.is_ascii_digit())
        && !rand.is_empty()
        && rand.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Generate a fresh frame file name.
pub fn frame_file_name() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{:04x}.json", now.as_millis(), rand_u16())
}

/// Write a frame atomically: temp file in the same directory, then rename.
pub fn write_frame<T: Serialize>(dir: &Path, frame: &T) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = frame_file_name();
    let final_path = dir.join(&name);
    let temp_path = dir.join(format!("{name}.tmp"));

    let content = serde_json::to_string(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &final_path)?;
    Ok(final_path)
}

/// Drop the close sentinel into a folder's input directory.
pub fn write_close_sentinel(paths: &IpcPaths, folder: &str) -> io::Result<()> {
    let input_dir = paths.input_dir(folder);
    fs::create_dir_all(&input_dir)?;
    fs::write(input_dir.join(CLOSE_SENTINEL), "")
}

fn rand_u16() -> u16 {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (t.subsec_nanos() ^ (t.as_secs() as u32).wrapping_mul(2654435761)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_validated() {
        assert!(is_valid_folder("main"));
        assert!(is_valid_folder("team-eng-2"));
        assert!(!is_valid_folder(""));
        assert!(!is_valid_folder("../etc"));
        assert!(!is_valid_folder("a/b"));
        assert!(!is_valid_folder("spaced name"));
    }

    #[test]
    fn frame_file_names_validated() {
        assert!(is_frame_file_name("1714000000000-a3f9.json"));
        assert!(is_frame_file_name("17-0.json"));
        assert!(!is_frame_file_name("_close"));
        assert!(!is_frame_file_name("nodash.json"));
        assert!(!is_frame_file_name("123-abc.txt"));
        assert!(!is_frame_file_name("123-ab!c.json"));
    }

    #[test]
    fn generated_name_matches_format() {
        assert!(is_frame_file_name(&frame_file_name()));
    }

    #[test]
    fn write_frame_is_atomic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("input");
        let frame = InputFrame::Message {
            text: "hello".into(),
        };

        let path = write_frame(&dir, &frame).unwrap();
        assert!(path.exists());

        // No temp residue left behind.
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let parsed: InputFrame =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        match parsed {
            InputFrame::Message { text } => assert_eq!(text, "hello"),
        }
    }

    #[test]
    fn close_sentinel_is_zero_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = IpcPaths::new(tmp.path());
        write_close_sentinel(&paths, "team-eng").unwrap();

        let sentinel = paths.input_dir("team-eng").join(CLOSE_SENTINEL);
        assert!(sentinel.exists());
        assert_eq!(fs::metadata(&sentinel).unwrap().len(), 0);
    }

    #[test]
    fn ensure_folder_creates_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = IpcPaths::new(tmp.path());
        paths.ensure_folder("main").unwrap();

        assert!(paths.input_dir("main").exists());
        assert!(paths.messages_dir("main").exists());
        assert!(paths.tasks_dir("main").exists());
        assert!(paths.errors_dir().exists());
    }

    #[test]
    fn task_command_parses_schedule() {
        let json = r#"{
            "type": "schedule_task",
            "prompt": "Check build status",
            "schedule_kind": "cron",
            "schedule_value": "0 9 * * *",
            "context_mode": "group",
            "target_chat_id": "tg:123"
        }"#;
        let cmd: TaskCommand = serde_json::from_str(json).unwrap();
        match cmd {
            TaskCommand::ScheduleTask {
                prompt,
                schedule_kind,
                schedule_value,
                context_mode,
                target_chat_id,
                target_folder,
            } => {
                assert_eq!(prompt, "Check build status");
                assert_eq!(schedule_kind, ScheduleKind::Cron);
                assert_eq!(schedule_value, "0 9 * * *");
                assert_eq!(context_mode, ContextMode::Group);
                assert_eq!(target_chat_id.as_deref(), Some("tg:123"));
                assert!(target_folder.is_none());
            }
            _ => panic!("expected ScheduleTask"),
        }
    }

    #[test]
    fn task_command_parses_cancel_and_refresh() {
        let cmd: TaskCommand =
            serde_json::from_str(r#"{"type":"cancel_task","task_id":"task-1"}"#).unwrap();
        assert!(matches!(cmd, TaskCommand::CancelTask { task_id } if task_id == "task-1"));

        let cmd: TaskCommand = serde_json::from_str(r#"{"type":"refresh_groups"}"#).unwrap();
        assert!(matches!(cmd, TaskCommand::RefreshGroups));
    }

    #[test]
    fn outbound_frame_parses_send_message() {
        let json = r#"{"type":"send_message","target_chat_id":"tg:99","text":"hi"}"#;
        let frame: OutboundFrame = serde_json::from_str(json).unwrap();
        match frame {
            OutboundFrame::SendMessage {
                target_chat_id,
                text,
            } => {
                assert_eq!(target_chat_id, "tg:99");
                assert_eq!(text, "hi");
            }
        }
    }

    #[test]
    fn folder_context_detects_main() {
        assert!(FolderContext::new("main", "main").is_main);
        assert!(!FolderContext::new("team-eng", "main").is_main);
    }
}
