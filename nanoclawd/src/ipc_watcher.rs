//! Filesystem IPC watcher.
//!
//! Polls every folder's `messages/` and `tasks/` directories, claims files
//! by renaming them away, and dispatches the frames. The directory a file
//! was read from is the command's identity: main may act on anything and
//! alone may register groups or refresh metadata; every other folder is
//! confined to its own chat and tasks. Malformed or unauthorized files move
//! to `ipc/errors/<folder>-<name>` and processing continues.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nanoclaw_core::error::{Error, Result};
use nanoclaw_core::ipc::{FolderContext, IpcPaths, OutboundFrame, TaskCommand, is_frame_file_name};
use nanoclaw_core::store::{RegisteredGroup, ScheduledTask, Store, TaskStatus, now_rfc3339};
use tracing::{debug, error, info, warn};

use crate::bus::{ChatBus, OutboundEvent};
use crate::message_loop::Groups;
use crate::scheduler::initial_next_run;

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub poll_interval: Duration,
    pub main_folder: String,
    pub timezone: String,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            main_folder: "main".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    paths: IpcPaths,
    store: Store,
    bus: Arc<ChatBus>,
    groups: Groups,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        paths: IpcPaths,
        store: Store,
        bus: Arc<ChatBus>,
        groups: Groups,
    ) -> Self {
        Self {
            config,
            paths,
            store,
            bus,
            groups,
        }
    }

    /// Run the polling loop until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        fs::create_dir_all(self.paths.root()).ok();
        self.recover_orphaned_claims();
        info!(dir = %self.paths.root().display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One polling cycle across every folder's queues.
    pub async fn poll_once(&self) {
        let folders = match fs::read_dir(self.paths.root()) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    e.file_type().is_ok_and(|ft| ft.is_dir()) && e.file_name() != "errors"
                })
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC root not readable");
                return;
            }
        };

        for folder in folders {
            let ctx = FolderContext::new(&folder, &self.config.main_folder);
            self.drain_dir(&self.paths.messages_dir(&folder), &ctx, Kind::Outbound)
                .await;
            self.drain_dir(&self.paths.tasks_dir(&folder), &ctx, Kind::Task)
                .await;
        }
    }

    async fn drain_dir(&self, dir: &Path, ctx: &FolderContext, kind: Kind) {
        for (claimed, original_name) in claim_frame_files(dir) {
            let outcome = self.handle_file(&claimed, ctx, kind).await;
            match outcome {
                Ok(()) => remove_file(&claimed),
                Err(Error::IpcUnauthorized { folder, detail }) => {
                    warn!(
                        folder = folder.as_str(),
                        detail = detail.as_str(),
                        file = original_name.as_str(),
                        "unauthorized IPC command quarantined"
                    );
                    self.quarantine(&claimed, &ctx.folder, &original_name);
                }
                Err(Error::IpcMalformed(detail)) => {
                    error!(
                        folder = ctx.folder.as_str(),
                        detail = detail.as_str(),
                        file = original_name.as_str(),
                        "malformed IPC file quarantined"
                    );
                    self.quarantine(&claimed, &ctx.folder, &original_name);
                }
                Err(e) if e.is_fatal() => {
                    error!(err = %e, "fatal storage error in IPC watcher, aborting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(folder = ctx.folder.as_str(), err = %e, "IPC dispatch failed");
                    self.quarantine(&claimed, &ctx.folder, &original_name);
                }
            }
        }
    }

    async fn handle_file(&self, path: &Path, ctx: &FolderContext, kind: Kind) -> Result<()> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::IpcMalformed(format!("unreadable file: {e}")))?;

        match kind {
            Kind::Outbound => {
                let frame: OutboundFrame = serde_json::from_str(&content)
                    .map_err(|e| Error::IpcMalformed(format!("bad outbound frame: {e}")))?;
                self.handle_outbound(ctx, frame).await
            }
            Kind::Task => {
                let cmd: TaskCommand = serde_json::from_str(&content)
                    .map_err(|e| Error::IpcMalformed(format!("bad task command: {e}")))?;
                self.handle_task(ctx, cmd).await
            }
        }
    }

    async fn handle_outbound(&self, ctx: &FolderContext, frame: OutboundFrame) -> Result<()> {
        let OutboundFrame::SendMessage {
            target_chat_id,
            text,
        } = frame;

        if target_chat_id.is_empty() || text.is_empty() {
            return Err(Error::IpcMalformed("send_message missing fields".into()));
        }

        if !ctx.is_main {
            let own_chat = self.chat_id_for_folder(&ctx.folder).await;
            if own_chat.as_deref() != Some(target_chat_id.as_str()) {
                return Err(Error::IpcUnauthorized {
                    folder: ctx.folder.clone(),
                    detail: format!("send_message to foreign chat {target_chat_id}"),
                });
            }
        }

        debug!(
            chat_id = target_chat_id.as_str(),
            folder = ctx.folder.as_str(),
            "dispatching sandbox message"
        );
        self.bus
            .publish_outbound(OutboundEvent {
                chat_id: target_chat_id,
                text,
            })
            .await;
        Ok(())
    }

    async fn handle_task(&self, ctx: &FolderContext, cmd: TaskCommand) -> Result<()> {
        match cmd {
            TaskCommand::ScheduleTask {
                prompt,
                schedule_kind,
                schedule_value,
                target_chat_id,
                target_folder,
                context_mode,
            } => {
                let (folder, chat_id) = self
                    .resolve_target(ctx, target_folder.as_deref(), target_chat_id.as_deref())
                    .await?;

                if prompt.is_empty() {
                    return Err(Error::IpcMalformed("schedule_task without prompt".into()));
                }
                let next_run = initial_next_run(schedule_kind, &schedule_value, &self.config.timezone);
                if next_run.is_none() {
                    return Err(Error::IpcMalformed(format!(
                        "unusable schedule: {} {:?}",
                        schedule_kind.as_str(),
                        schedule_value
                    )));
                }

                let task = ScheduledTask {
                    id: new_task_id(),
                    folder,
                    chat_id,
                    prompt,
                    schedule_kind,
                    schedule_value,
                    context_mode,
                    next_run,
                    last_run: None,
                    last_result: None,
                    status: TaskStatus::Active,
                    created_at: now_rfc3339(),
                };
                self.store.create_task(&task)?;
                info!(
                    task_id = task.id.as_str(),
                    folder = task.folder.as_str(),
                    kind = task.schedule_kind.as_str(),
                    "task scheduled via IPC"
                );
                Ok(())
            }

            TaskCommand::PauseTask { task_id } => {
                self.update_task_status(ctx, &task_id, TaskStatus::Paused).await
            }
            TaskCommand::CancelTask { task_id } => {
                self.update_task_status(ctx, &task_id, TaskStatus::Cancelled).await
            }
            TaskCommand::ResumeTask { task_id } => {
                let task = self.authorized_task(ctx, &task_id).await?;
                let Some(task) = task else { return Ok(()) };
                self.store.set_task_status(&task_id, TaskStatus::Active)?;
                let next =
                    initial_next_run(task.schedule_kind, &task.schedule_value, &self.config.timezone);
                self.store.set_task_next_run(&task_id, next.as_deref())?;
                info!(task_id = task_id.as_str(), "task resumed via IPC");
                Ok(())
            }

            TaskCommand::RefreshGroups => {
                if !ctx.is_main {
                    return Err(Error::IpcUnauthorized {
                        folder: ctx.folder.clone(),
                        detail: "refresh_groups requires the main folder".into(),
                    });
                }
                self.refresh_groups().await
            }

            TaskCommand::RegisterGroup {
                chat_id,
                name,
                folder,
                trigger_pattern,
                requires_trigger,
            } => {
                if !ctx.is_main {
                    return Err(Error::IpcUnauthorized {
                        folder: ctx.folder.clone(),
                        detail: "register_group requires the main folder".into(),
                    });
                }
                if !nanoclaw_core::is_valid_folder(&folder) {
                    return Err(Error::IpcMalformed(format!(
                        "invalid group folder {folder:?}"
                    )));
                }
                if chat_id.is_empty() || name.is_empty() {
                    return Err(Error::IpcMalformed("register_group missing fields".into()));
                }

                let group = RegisteredGroup {
                    chat_id: chat_id.clone(),
                    name,
                    folder: folder.clone(),
                    trigger_pattern: trigger_pattern.unwrap_or_default(),
                    added_at: now_rfc3339(),
                    container_config: None,
                    requires_trigger: requires_trigger.unwrap_or(true),
                };
                self.store.upsert_registered_group(&group)?;
                self.paths.ensure_folder(&folder).map_err(|e| {
                    Error::IpcMalformed(format!("cannot create IPC namespace: {e}"))
                })?;
                self.groups.write().await.insert(chat_id, group);
                info!(folder = folder.as_str(), "group registered via IPC");
                Ok(())
            }
        }
    }

    /// Resolve a task command's target to `(folder, chat_id)` and enforce
    /// that non-main folders stay within themselves.
    async fn resolve_target(
        &self,
        ctx: &FolderContext,
        target_folder: Option<&str>,
        target_chat_id: Option<&str>,
    ) -> Result<(String, String)> {
        let groups = self.groups.read().await;

        let resolved = if let Some(folder) = target_folder {
            groups.values().find(|g| g.folder == folder).cloned()
        } else if let Some(chat_id) = target_chat_id {
            groups.get(chat_id).cloned()
        } else {
            groups.values().find(|g| g.folder == ctx.folder).cloned()
        };

        let Some(group) = resolved else {
            return Err(Error::IpcMalformed(format!(
                "target group not registered (folder={target_folder:?}, chat={target_chat_id:?})"
            )));
        };

        if !ctx.is_main && group.folder != ctx.folder {
            return Err(Error::IpcUnauthorized {
                folder: ctx.folder.clone(),
                detail: format!("task targets foreign folder {}", group.folder),
            });
        }

        Ok((group.folder, group.chat_id))
    }

    /// Load a task and verify the caller may act on it. Unknown ids are
    /// logged and dropped rather than quarantined.
    async fn authorized_task(
        &self,
        ctx: &FolderContext,
        task_id: &str,
    ) -> Result<Option<ScheduledTask>> {
        let Some(task) = self.store.get_task(task_id)? else {
            warn!(task_id, folder = ctx.folder.as_str(), "task command for unknown id");
            return Ok(None);
        };
        if !ctx.is_main && task.folder != ctx.folder {
            return Err(Error::IpcUnauthorized {
                folder: ctx.folder.clone(),
                detail: format!("task {task_id} belongs to folder {}", task.folder),
            });
        }
        Ok(Some(task))
    }

    async fn update_task_status(
        &self,
        ctx: &FolderContext,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        let task = self.authorized_task(ctx, task_id).await?;
        if task.is_none() {
            return Ok(());
        }
        self.store.set_task_status(task_id, status)?;
        info!(task_id, status = status.as_str(), "task status updated via IPC");
        Ok(())
    }

    /// Reload the registered-group cache from the store and drop a fresh
    /// chat snapshot into the main folder's IPC namespace.
    async fn refresh_groups(&self) -> Result<()> {
        let loaded = self.store.get_registered_groups()?;
        let count = loaded.len();
        *self.groups.write().await = loaded;

        let chats = self.store.get_all_chats()?;
        let snapshot = serde_json::to_string_pretty(&chats).unwrap_or_else(|_| "[]".into());
        let snapshot_path = self
            .paths
            .folder_dir(&self.config.main_folder)
            .join("available_chats.json");
        if let Err(e) = fs::write(&snapshot_path, snapshot) {
            warn!(err = %e, "failed to write chat snapshot");
        }

        info!(groups = count, "group registry refreshed via IPC");
        Ok(())
    }

    async fn chat_id_for_folder(&self, folder: &str) -> Option<String> {
        let groups = self.groups.read().await;
        groups
            .values()
            .find(|g| g.folder == folder)
            .map(|g| g.chat_id.clone())
    }

    /// Files claimed by a previous process that died mid-handling keep their
    /// `.processing` suffix; return them to the queue so no frame is lost.
    pub fn recover_orphaned_claims(&self) {
        let Ok(entries) = fs::read_dir(self.paths.root()) else {
            return;
        };
        let folders: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().is_ok_and(|ft| ft.is_dir()) && e.file_name() != "errors")
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        for folder in folders {
            for dir in [self.paths.messages_dir(&folder), self.paths.tasks_dir(&folder)] {
                let Ok(entries) = fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Some(original) = name.strip_suffix(".processing") else {
                        continue;
                    };
                    if is_frame_file_name(original)
                        && fs::rename(entry.path(), dir.join(original)).is_ok()
                    {
                        warn!(
                            folder = folder.as_str(),
                            file = original,
                            "recovered orphaned IPC claim"
                        );
                    }
                }
            }
        }
    }

    fn quarantine(&self, claimed: &Path, folder: &str, original_name: &str) {
        let errors_dir = self.paths.errors_dir();
        fs::create_dir_all(&errors_dir).ok();
        let dest = errors_dir.join(format!("{folder}-{original_name}"));
        if let Err(err) = fs::rename(claimed, &dest) {
            error!(path = %claimed.display(), err = %err, "failed to quarantine IPC file");
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Outbound,
    Task,
}

/// Enumerate frame files in name order and claim each by renaming it away.
/// A file that cannot be renamed was taken by someone else and is skipped.
fn claim_frame_files(dir: &Path) -> Vec<(PathBuf, String)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| is_frame_file_name(name))
        .collect();
    names.sort();

    let mut claimed = Vec::new();
    for name in names {
        let original = dir.join(&name);
        let claim = dir.join(format!("{name}.processing"));
        if fs::rename(&original, &claim).is_ok() {
            claimed.push((claim, name));
        }
    }
    claimed
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "failed to remove processed IPC file");
    }
}

fn new_task_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "task-{}-{:04x}",
        now.as_millis(),
        (now.subsec_nanos() & 0xffff) as u16
    )
}
