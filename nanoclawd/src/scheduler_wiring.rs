//! Scheduler → group queue wiring.
//!
//! Builds the callback the scheduler loop fires for each due task. The
//! callback enqueues a task run (tasks outrank messages within a folder and
//! dedupe by id), and the run itself spawns a sandbox with the task prompt,
//! delivers output to the task's chat, logs the run, and advances
//! `next_run`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nanoclaw_core::sandbox::{SandboxInput, SandboxOutput, SandboxStatus};
use nanoclaw_core::store::{ContextMode, ScheduledTask, Store, TaskRunLog, now_rfc3339};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::bus::{ChatBus, OutboundEvent};
use crate::message_loop::Groups;
use crate::queue::GroupQueue;
use crate::sandbox::runner::{OutputCallback, RunConfig, run_sandbox};
use crate::sandbox::{GroupInfo, security::GroupContainerConfig};
use crate::scheduler::{TaskCallback, calculate_next_run, result_summary};

/// Shared state a task run closes over.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Store,
    pub queue: Arc<GroupQueue>,
    pub groups: Groups,
    pub bus: Arc<ChatBus>,
    pub assistant_name: String,
    pub run_config: RunConfig,
    pub timezone: String,
}

/// Build the `TaskCallback` handed to the scheduler loop.
pub fn build_task_callback(ctx: TaskContext) -> TaskCallback {
    Box::new(move |task: ScheduledTask| {
        let ctx = ctx.clone();
        let folder = task.folder.clone();
        let task_id = task.id.clone();
        let queue = ctx.queue.clone();

        let task_fn = Box::new(move || -> futures::future::BoxFuture<'static, ()> {
            Box::pin(async move {
                run_scheduled_task(task, &ctx).await;
            })
        });

        tokio::spawn(async move {
            if !queue.enqueue_task(&folder, &task_id, task_fn).await {
                debug!(
                    task_id = task_id.as_str(),
                    folder = folder.as_str(),
                    "task already in flight, not re-enqueued"
                );
            }
        });
    })
}

/// Execute one scheduled task inside a sandbox.
async fn run_scheduled_task(task: ScheduledTask, ctx: &TaskContext) {
    let start = Instant::now();

    let group = {
        let groups = ctx.groups.read().await;
        groups.values().find(|g| g.folder == task.folder).cloned()
    };
    let Some(group) = group else {
        error!(
            task_id = task.id.as_str(),
            folder = task.folder.as_str(),
            "scheduled task references an unknown folder"
        );
        log_and_update(ctx, &task, start, None, Some("unknown group folder")).await;
        return;
    };

    // Group-context tasks continue the folder's conversation; isolated
    // tasks start fresh.
    let session_id = match task.context_mode {
        ContextMode::Group => ctx.store.get_session(&task.folder).ok().flatten(),
        ContextMode::Isolated => None,
    };

    let input = SandboxInput {
        prompt: task.prompt.clone(),
        session_id,
        folder: task.folder.clone(),
        chat_id: task.chat_id.clone(),
        is_main: false,
        is_scheduled_task: Some(true),
        assistant_name: Some(ctx.assistant_name.clone()),
        secrets: None,
    };

    let group_info = GroupInfo {
        folder: group.folder.clone(),
        name: group.name.clone(),
        container_config: group
            .container_config
            .as_ref()
            .and_then(|v| serde_json::from_value::<GroupContainerConfig>(v.clone()).ok()),
    };

    let result_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
    let error_text: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
    let session_saved = Arc::new(AtomicBool::new(false));

    let on_output = Some(Arc::new(build_task_output_callback(
        ctx.clone(),
        task.folder.clone(),
        task.chat_id.clone(),
        task.context_mode,
        result_text.clone(),
        error_text.clone(),
        session_saved.clone(),
    )));

    info!(
        task_id = task.id.as_str(),
        folder = task.folder.as_str(),
        "running scheduled task"
    );

    let run = run_sandbox(&group_info, &input, false, &ctx.run_config, on_output, None).await;

    let result = result_text.read().await.clone();
    let error = error_text.read().await.clone();

    let (final_result, final_error) = match run {
        Ok(run) => {
            // Fallback only: the stream callback persists the run's first
            // session id as it arrives.
            if let Some(sid) = &run.output.new_session_id {
                if task.context_mode == ContextMode::Group
                    && !session_saved.swap(true, Ordering::SeqCst)
                {
                    if let Err(e) = ctx.store.set_session(&task.folder, sid) {
                        warn!(folder = task.folder.as_str(), err = %e, "failed to persist session");
                    }
                }
            }
            if run.output.status == SandboxStatus::Error {
                let err = error
                    .or(run.output.error)
                    .unwrap_or_else(|| "unknown error".into());
                (result, Some(err))
            } else {
                (result, None)
            }
        }
        Err(e) => {
            error!(task_id = task.id.as_str(), err = %e, "task sandbox error");
            (result, Some(e.to_string()))
        }
    };

    log_and_update(ctx, &task, start, final_result.as_deref(), final_error.as_deref()).await;
}

fn build_task_output_callback(
    ctx: TaskContext,
    folder: String,
    chat_id: String,
    context_mode: ContextMode,
    result_text: Arc<RwLock<Option<String>>>,
    error_text: Arc<RwLock<Option<String>>>,
    session_saved: Arc<AtomicBool>,
) -> OutputCallback {
    Box::new(move |record: SandboxOutput| {
        let ctx = ctx.clone();
        let folder = folder.clone();
        let chat_id = chat_id.clone();
        let result_text = result_text.clone();
        let error_text = error_text.clone();
        let session_saved = session_saved.clone();

        Box::pin(async move {
            // Only the first announced session id sticks; later records may
            // carry stale or retried ids.
            if let Some(sid) = &record.new_session_id {
                if context_mode == ContextMode::Group
                    && !session_saved.swap(true, Ordering::SeqCst)
                {
                    if let Err(e) = ctx.store.set_session(&folder, sid) {
                        warn!(folder = folder.as_str(), err = %e, "failed to persist session");
                    }
                }
            }

            if let Some(text) = record.result.as_deref().filter(|t| !t.is_empty()) {
                ctx.bus
                    .publish_outbound(OutboundEvent {
                        chat_id: chat_id.clone(),
                        text: text.to_string(),
                    })
                    .await;
                *result_text.write().await = Some(text.to_string());
            }

            if record.status == SandboxStatus::Error {
                let err = record.error.clone().unwrap_or_else(|| "unknown error".into());
                *error_text.write().await = Some(err);
            }
        })
    })
}

/// Append the run log and advance the task's `next_run`.
async fn log_and_update(
    ctx: &TaskContext,
    task: &ScheduledTask,
    start: Instant,
    result: Option<&str>,
    error: Option<&str>,
) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let status = if error.is_some() { "error" } else { "success" };

    let log = TaskRunLog {
        task_id: task.id.clone(),
        run_at: now_rfc3339(),
        duration_ms,
        status: status.into(),
        result: result.map(String::from),
        error: error.map(String::from),
    };
    if let Err(e) = ctx.store.append_task_run_log(&log) {
        error!(task_id = task.id.as_str(), err = %e, "failed to log task run");
    }

    let next_run = calculate_next_run(task.schedule_kind, &task.schedule_value, &ctx.timezone);
    let summary = result_summary(result, error);

    if let Err(e) = ctx
        .store
        .update_task_after_run(&task.id, next_run.as_deref(), &summary)
    {
        error!(task_id = task.id.as_str(), err = %e, "failed to update task after run");
    }

    info!(
        task_id = task.id.as_str(),
        status,
        duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "scheduled task finished"
    );
}
