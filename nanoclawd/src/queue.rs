//! Per-folder group queue with a global concurrency cap.
//!
//! One sandbox per folder at a time, at most `max_concurrent` across all
//! folders. Tasks drain before messages within a folder; across folders,
//! waiters wake FIFO. Follow-up messages are piped into a live idle-waiting
//! sandbox through its IPC `input/` directory instead of spawning a new one.
//! Failed message runs retry with exponential backoff; past `max_retries`
//! the folder parks until the next enqueue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nanoclaw_core::config::QueueConfig;
use nanoclaw_core::ipc::{self, InputFrame, IpcPaths};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Callback that processes pending messages for a folder. Returns true on success.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Callback that runs one queued task to completion.
pub type TaskFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct QueuedTask {
    id: String,
    task_fn: TaskFn,
}

/// Per-folder state. Owned by the queue; nothing outside reads or writes it.
#[derive(Default)]
struct GroupState {
    active: bool,
    idle_waiting: bool,
    is_task_container: bool,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    running_task_id: Option<String>,
    container_name: Option<String>,
    activity: Option<watch::Sender<Instant>>,
    retry_count: u32,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    waiting_folders: VecDeque<String>,
    process_messages_fn: Option<ProcessMessagesFn>,
    shutting_down: bool,
    config: QueueConfig,
    ipc: IpcPaths,
}

impl Inner {
    fn get_or_insert(&mut self, folder: &str) -> &mut GroupState {
        self.groups.entry(folder.to_string()).or_default()
    }

    fn park_waiter(&mut self, folder: &str) {
        let folder = folder.to_string();
        if !self.waiting_folders.contains(&folder) {
            self.waiting_folders.push_back(folder);
        }
    }

    fn deactivate(&mut self, folder: &str) {
        if let Some(state) = self.groups.get_mut(folder) {
            state.active = false;
            state.idle_waiting = false;
            state.is_task_container = false;
            state.running_task_id = None;
            state.container_name = None;
            state.activity = None;
        }
        self.active_count = self.active_count.saturating_sub(1);
    }
}

/// The group queue. Cheap to clone and share across subsystems.
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

enum Work {
    Messages(String),
    Task(String, QueuedTask),
}

impl GroupQueue {
    pub fn new(config: QueueConfig, ipc: IpcPaths) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                waiting_folders: VecDeque::new(),
                process_messages_fn: None,
                shutting_down: false,
                config,
                ipc,
            })),
        }
    }

    /// Set the callback invoked to process messages for a folder.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Enqueue a message check for a folder. Runs immediately when the folder
    /// is idle and a concurrency slot is free, otherwise parks.
    pub async fn enqueue_message_check(&self, folder: &str) {
        let spawn = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }

            let at_capacity = inner.active_count >= inner.config.max_concurrent;
            let state = inner.get_or_insert(folder);

            if state.active {
                state.pending_messages = true;
                debug!(folder, "sandbox active, message check queued");
                return;
            }

            if at_capacity {
                state.pending_messages = true;
                inner.park_waiter(folder);
                debug!(
                    folder,
                    active_count = inner.active_count,
                    "at concurrency limit, message check queued"
                );
                return;
            }

            state.active = true;
            state.idle_waiting = false;
            state.is_task_container = false;
            state.pending_messages = false;
            inner.active_count += 1;
            true
        };

        if spawn {
            spawn_messages(self.inner.clone(), folder.to_string());
        }
    }

    /// Enqueue a task run for a folder. Tasks have priority over messages.
    /// Returns false when the same task id is already queued or running.
    pub async fn enqueue_task(&self, folder: &str, task_id: &str, task_fn: TaskFn) -> bool {
        let task_to_run = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return false;
            }

            let at_capacity = inner.active_count >= inner.config.max_concurrent;
            let ipc = inner.ipc.clone();
            let state = inner.get_or_insert(folder);

            if state.running_task_id.as_deref() == Some(task_id)
                || state.pending_tasks.iter().any(|t| t.id == task_id)
            {
                debug!(folder, task_id, "task already in flight, skipping");
                return false;
            }

            if state.active {
                state.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    task_fn,
                });
                // Preempt an idle sandbox so the task can take the slot.
                if state.idle_waiting {
                    if let Err(e) = ipc::write_close_sentinel(&ipc, folder) {
                        warn!(folder, err = %e, "failed to write close sentinel");
                    }
                }
                debug!(folder, task_id, "sandbox active, task queued");
                return true;
            }

            if at_capacity {
                state.pending_tasks.push_back(QueuedTask {
                    id: task_id.to_string(),
                    task_fn,
                });
                inner.park_waiter(folder);
                debug!(folder, task_id, "at concurrency limit, task queued");
                return true;
            }

            state.active = true;
            state.idle_waiting = false;
            state.is_task_container = true;
            state.running_task_id = Some(task_id.to_string());
            inner.active_count += 1;

            Some(QueuedTask {
                id: task_id.to_string(),
                task_fn,
            })
        };

        if let Some(task) = task_to_run {
            spawn_task(self.inner.clone(), folder.to_string(), task);
        }
        true
    }

    /// True when the given task id is queued or currently running.
    pub async fn task_in_flight(&self, folder: &str, task_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.groups.get(folder).is_some_and(|s| {
            s.running_task_id.as_deref() == Some(task_id)
                || s.pending_tasks.iter().any(|t| t.id == task_id)
        })
    }

    /// Record the live container for a folder, with an activity handle the
    /// idle watchdog listens on.
    pub async fn register_process(
        &self,
        folder: &str,
        container_name: &str,
        activity: watch::Sender<Instant>,
    ) {
        let mut inner = self.inner.lock().await;
        let state = inner.get_or_insert(folder);
        state.container_name = Some(container_name.to_string());
        state.activity = Some(activity);
    }

    /// Mark a folder's sandbox as idle-waiting (successful non-final output,
    /// process still alive). If tasks are already pending, immediately ask the
    /// sandbox to wind down so the task can run.
    pub async fn notify_idle(&self, folder: &str) {
        let mut inner = self.inner.lock().await;
        let ipc = inner.ipc.clone();
        let state = inner.get_or_insert(folder);
        if !state.active || state.is_task_container {
            return;
        }
        state.idle_waiting = true;
        if !state.pending_tasks.is_empty() {
            if let Err(e) = ipc::write_close_sentinel(&ipc, folder) {
                warn!(folder, err = %e, "failed to write close sentinel");
            }
        }
    }

    /// Pipe a follow-up prompt into a live idle-waiting sandbox.
    ///
    /// Returns true when the prompt was written to the folder's IPC input
    /// directory; false when there is no reusable sandbox (caller should
    /// enqueue a fresh message check instead). Task containers never accept
    /// piped messages.
    pub async fn send_message(&self, folder: &str, text: &str) -> bool {
        let input_dir = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return false;
            }
            let ipc = inner.ipc.clone();
            let state = match inner.groups.get_mut(folder) {
                Some(s) => s,
                None => return false,
            };
            if !state.active || !state.idle_waiting || state.is_task_container {
                return false;
            }
            if let Some(activity) = &state.activity {
                let _ = activity.send(Instant::now());
            }
            state.idle_waiting = false;
            ipc.input_dir(folder)
        };

        match ipc::write_frame(
            &input_dir,
            &InputFrame::Message {
                text: text.to_string(),
            },
        ) {
            Ok(_) => true,
            Err(e) => {
                error!(folder, err = %e, "failed to write IPC input frame");
                // The pipe failed; let the caller fall back to a fresh run.
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.groups.get_mut(folder) {
                    state.idle_waiting = true;
                }
                false
            }
        }
    }

    /// Check whether a folder has a live sandbox.
    pub async fn is_active(&self, folder: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.groups.get(folder).is_some_and(|s| s.active)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    /// Graceful shutdown barrier.
    ///
    /// Rejects new work, writes a close sentinel into every live folder's IPC
    /// input directory, waits up to `timeout` for sandboxes to drain, then
    /// force-kills survivors. When this returns, no sandbox owned by the
    /// orchestrator is alive.
    pub async fn shutdown(&self, timeout: Duration) {
        let live_folders = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            inner
                .groups
                .iter()
                .filter(|(_, s)| s.active)
                .map(|(f, _)| f.clone())
                .collect::<Vec<_>>()
        };

        {
            let inner = self.inner.lock().await;
            for folder in &live_folders {
                if let Err(e) = ipc::write_close_sentinel(&inner.ipc, folder) {
                    warn!(folder = folder.as_str(), err = %e, "failed to write shutdown sentinel");
                }
            }
        }

        info!(
            live = live_folders.len(),
            timeout_ms = timeout.as_millis() as u64,
            "queue shutting down"
        );

        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count().await == 0 {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Survivors get hard-killed.
        let survivors: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .values()
                .filter(|s| s.active)
                .filter_map(|s| s.container_name.clone())
                .collect()
        };

        for name in &survivors {
            warn!(container = name.as_str(), "force-killing sandbox at shutdown");
            let _ = tokio::process::Command::new("docker")
                .args(["kill", name])
                .output()
                .await;
        }

        // Give the exit handlers a moment to observe the deaths.
        let grace = Instant::now() + Duration::from_secs(5);
        while self.active_count().await > 0 && Instant::now() < grace {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Execution + drain
// ---------------------------------------------------------------------------

fn spawn_messages(queue: Arc<Mutex<Inner>>, folder: String) {
    tokio::spawn(async move {
        run_messages(queue, folder).await;
    });
}

fn spawn_task(queue: Arc<Mutex<Inner>>, folder: String, task: QueuedTask) {
    tokio::spawn(async move {
        run_task(queue, folder, task).await;
    });
}

async fn run_messages(queue: Arc<Mutex<Inner>>, folder: String) {
    debug!(folder = folder.as_str(), "processing messages for folder");

    let process_fn = {
        let inner = queue.lock().await;
        inner.process_messages_fn.clone()
    };

    let success = if let Some(f) = process_fn {
        f(folder.clone()).await
    } else {
        warn!(folder = folder.as_str(), "no process_messages_fn set");
        false
    };

    let mut inner = queue.lock().await;

    if success {
        if let Some(state) = inner.groups.get_mut(&folder) {
            state.retry_count = 0;
        }
    } else {
        let retry_count = inner
            .groups
            .get(&folder)
            .map(|s| s.retry_count + 1)
            .unwrap_or(1);
        if let Some(state) = inner.groups.get_mut(&folder) {
            state.retry_count = retry_count;
        }

        if retry_count <= inner.config.max_retries && !inner.shutting_down {
            let delay = Duration::from_millis(
                inner.config.base_retry_ms * 2u64.pow(retry_count - 1),
            );
            info!(
                folder = folder.as_str(),
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry with backoff"
            );
            let queue_clone = queue.clone();
            let folder_clone = folder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                requeue_messages(queue_clone, folder_clone).await;
            });
        } else if retry_count > inner.config.max_retries {
            error!(
                folder = folder.as_str(),
                retry_count, "max retries exceeded, parking folder until next enqueue"
            );
            if let Some(state) = inner.groups.get_mut(&folder) {
                state.retry_count = 0;
            }
        }
    }

    finish_folder(&mut inner, &queue, &folder);
}

async fn run_task(queue: Arc<Mutex<Inner>>, folder: String, task: QueuedTask) {
    debug!(
        folder = folder.as_str(),
        task_id = task.id.as_str(),
        "running queued task"
    );

    (task.task_fn)().await;

    let mut inner = queue.lock().await;
    finish_folder(&mut inner, &queue, &folder);
}

/// Re-entry path used by retry timers: behaves like an external enqueue.
async fn requeue_messages(queue: Arc<Mutex<Inner>>, folder: String) {
    let spawn = {
        let mut inner = queue.lock().await;
        if inner.shutting_down {
            return;
        }
        let at_capacity = inner.active_count >= inner.config.max_concurrent;
        let state = inner.get_or_insert(&folder);
        if state.active {
            state.pending_messages = true;
            return;
        }
        if at_capacity {
            state.pending_messages = true;
            inner.park_waiter(&folder);
            return;
        }
        state.active = true;
        state.idle_waiting = false;
        state.is_task_container = false;
        state.pending_messages = false;
        inner.active_count += 1;
        true
    };
    if spawn {
        spawn_messages(queue, folder);
    }
}

/// Deactivate a folder and drain: pending tasks first, then pending
/// messages; otherwise free the slot and wake the first waiter with work.
fn finish_folder(inner: &mut Inner, queue: &Arc<Mutex<Inner>>, folder: &str) {
    inner.deactivate(folder);

    if inner.shutting_down {
        return;
    }

    if let Some(work) = claim_work(inner, folder) {
        dispatch(queue.clone(), work);
        return;
    }

    // Slot freed; wake the first waiting folder that still has work.
    while let Some(next) = inner.waiting_folders.pop_front() {
        if inner.active_count >= inner.config.max_concurrent {
            inner.waiting_folders.push_front(next);
            return;
        }
        if let Some(work) = claim_work(inner, &next) {
            dispatch(queue.clone(), work);
            return;
        }
    }
}

/// Try to activate `folder` for its highest-priority pending work.
fn claim_work(inner: &mut Inner, folder: &str) -> Option<Work> {
    if inner.active_count >= inner.config.max_concurrent {
        return None;
    }
    let state = inner.groups.get_mut(folder)?;
    if state.active {
        return None;
    }

    if let Some(task) = state.pending_tasks.pop_front() {
        state.active = true;
        state.idle_waiting = false;
        state.is_task_container = true;
        state.running_task_id = Some(task.id.clone());
        inner.active_count += 1;
        return Some(Work::Task(folder.to_string(), task));
    }

    if state.pending_messages {
        state.active = true;
        state.idle_waiting = false;
        state.is_task_container = false;
        state.pending_messages = false;
        inner.active_count += 1;
        return Some(Work::Messages(folder.to_string()));
    }

    None
}

fn dispatch(queue: Arc<Mutex<Inner>>, work: Work) {
    match work {
        Work::Messages(folder) => spawn_messages(queue, folder),
        Work::Task(folder, task) => spawn_task(queue, folder, task),
    }
}
