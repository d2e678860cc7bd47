//! Per-group message processor, invoked by the queue when it is a folder's
//! turn.
//!
//! Flow: look the group up, load its missed window, re-check the trigger,
//! format the prompt, tentatively advance the per-chat agent cursor, run the
//! sandbox, deliver streamed results to the chat, and roll the cursor back
//! if the run fails. The cursor only stays advanced across a successful run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nanoclaw_core::sandbox::{SandboxInput, SandboxOutput, SandboxStatus};
use nanoclaw_core::store::{Message, Store, now_rfc3339};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{ChatBus, OutboundEvent};
use crate::message_loop::{
    self, Groups, build_trigger_regex, format_messages, truncate_window,
};
use crate::queue::{GroupQueue, ProcessMessagesFn};
use crate::sandbox::runner::{OutputCallback, RunConfig, SpawnHook, run_sandbox};
use crate::sandbox::{GroupInfo, security::GroupContainerConfig};

/// Shared state the processor closes over.
#[derive(Clone)]
pub struct ProcessContext {
    pub store: Store,
    pub queue: Arc<GroupQueue>,
    pub groups: Groups,
    pub bus: Arc<ChatBus>,
    pub assistant_name: String,
    pub main_folder: String,
    pub max_context_messages: usize,
    pub run_config: RunConfig,
}

/// Map a namespaced chat id to its channel name.
pub fn channel_from_chat_id(chat_id: &str) -> &'static str {
    if chat_id.starts_with("tg:") {
        "telegram"
    } else if chat_id.starts_with("dc:") {
        "discord"
    } else if chat_id.starts_with("wa:") {
        "whatsapp"
    } else {
        "unknown"
    }
}

/// Build the `ProcessMessagesFn` the queue invokes per folder turn.
pub fn build_process_messages_fn(ctx: ProcessContext) -> ProcessMessagesFn {
    Arc::new(move |folder: String| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match process_folder_messages(&folder, &ctx).await {
                Ok(success) => success,
                Err(e) => {
                    error!(folder = folder.as_str(), err = %e, "message processing failed");
                    false
                }
            }
        })
    })
}

async fn process_folder_messages(folder: &str, ctx: &ProcessContext) -> anyhow::Result<bool> {
    let group = {
        let groups = ctx.groups.read().await;
        match groups.values().find(|g| g.folder == folder) {
            Some(g) => g.clone(),
            // Unknown folder: nothing to do, not an error.
            None => return Ok(true),
        }
    };
    let chat_id = group.chat_id.clone();
    let is_main = group.folder == ctx.main_folder;

    let mut agent_cursors = message_loop::load_agent_cursors(&ctx.store);
    let previous = agent_cursors.get(&chat_id).cloned();

    let window = truncate_window(
        ctx.store
            .messages_since(&chat_id, previous.as_deref().unwrap_or(""))?,
        ctx.max_context_messages,
    );
    if window.is_empty() || window.iter().all(|m| m.is_from_me) {
        return Ok(true);
    }

    if !is_main && group.requires_trigger {
        let re = build_trigger_regex(&ctx.assistant_name, &group.trigger_pattern);
        let triggered = window
            .iter()
            .any(|m| !m.is_from_me && re.is_match(m.content.trim()));
        if !triggered {
            return Ok(true);
        }
    }

    let prompt = format_messages(&window);
    let window_max = window.last().map(|m| m.timestamp.clone()).unwrap_or_default();

    // Tentative advance; rolled back below on any failed run.
    agent_cursors.insert(chat_id.clone(), window_max);
    message_loop::save_agent_cursors(&ctx.store, &agent_cursors)?;

    info!(
        folder = group.folder.as_str(),
        messages = window.len(),
        "processing window"
    );

    let input = SandboxInput {
        prompt,
        session_id: ctx.store.get_session(&group.folder)?,
        folder: group.folder.clone(),
        chat_id: chat_id.clone(),
        is_main,
        is_scheduled_task: None,
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

    let output_sent = Arc::new(AtomicBool::new(false));
    let session_saved = Arc::new(AtomicBool::new(false));
    let on_output = Some(Arc::new(build_output_callback(
        ctx.clone(),
        group.folder.clone(),
        chat_id.clone(),
        output_sent.clone(),
        session_saved.clone(),
    )));

    let queue_for_spawn = ctx.queue.clone();
    let folder_for_spawn = group.folder.clone();
    let on_spawn: SpawnHook = Box::new(move |name: String, activity: watch::Sender<Instant>| {
        Box::pin(async move {
            queue_for_spawn
                .register_process(&folder_for_spawn, &name, activity)
                .await;
        })
    });

    let result = run_sandbox(
        &group_info,
        &input,
        is_main,
        &ctx.run_config,
        on_output,
        Some(on_spawn),
    )
    .await;

    match result {
        Ok(run) => {
            // Fallback only: the stream callback persists the run's first
            // session id as it arrives.
            if let Some(sid) = &run.output.new_session_id {
                if !session_saved.swap(true, Ordering::SeqCst) {
                    ctx.store.set_session(&group.folder, sid)?;
                }
            }

            if run.output.status == SandboxStatus::Error {
                rollback_cursor(&mut agent_cursors, &chat_id, previous);
                message_loop::save_agent_cursors(&ctx.store, &agent_cursors)?;
                warn!(
                    folder = group.folder.as_str(),
                    output_sent = output_sent.load(Ordering::SeqCst),
                    "agent run failed, rolled cursor back"
                );
                return Ok(false);
            }
            Ok(true)
        }
        Err(e) => {
            error!(folder = group.folder.as_str(), err = %e, "sandbox run error");
            rollback_cursor(&mut agent_cursors, &chat_id, previous);
            message_loop::save_agent_cursors(&ctx.store, &agent_cursors)?;
            Ok(false)
        }
    }
}

fn rollback_cursor(
    cursors: &mut std::collections::HashMap<String, String>,
    chat_id: &str,
    previous: Option<String>,
) {
    match previous {
        Some(p) => cursors.insert(chat_id.to_string(), p),
        None => cursors.remove(chat_id),
    };
}

/// Per-record callback: persist the run's first session id, forward results
/// to the chat, store the reply, and flip the folder to idle-waiting on
/// success.
fn build_output_callback(
    ctx: ProcessContext,
    folder: String,
    chat_id: String,
    output_sent: Arc<AtomicBool>,
    session_saved: Arc<AtomicBool>,
) -> OutputCallback {
    Box::new(move |record: SandboxOutput| {
        let ctx = ctx.clone();
        let folder = folder.clone();
        let chat_id = chat_id.clone();
        let output_sent = output_sent.clone();
        let session_saved = session_saved.clone();

        Box::pin(async move {
            // Only the first announced session id sticks; later records may
            // carry stale or retried ids.
            if let Some(sid) = &record.new_session_id {
                if !session_saved.swap(true, Ordering::SeqCst) {
                    if let Err(e) = ctx.store.set_session(&folder, sid) {
                        warn!(folder = folder.as_str(), err = %e, "failed to persist session");
                    }
                }
            }

            // A structured error still forwards any human-readable result;
            // the technical error lands in the log only.
            if let Some(text) = record.result.as_deref().filter(|t| !t.is_empty()) {
                ctx.bus
                    .publish_outbound(OutboundEvent {
                        chat_id: chat_id.clone(),
                        text: text.to_string(),
                    })
                    .await;

                let reply = Message {
                    id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
                    chat_id: chat_id.clone(),
                    channel: channel_from_chat_id(&chat_id).to_string(),
                    sender_id: "nanoclaw".into(),
                    sender_name: ctx.assistant_name.clone(),
                    content: text.to_string(),
                    timestamp: now_rfc3339(),
                    is_from_me: true,
                };
                if let Err(e) = ctx.store.store_message(&reply) {
                    warn!(chat_id = chat_id.as_str(), err = %e, "failed to store reply");
                }
                output_sent.store(true, Ordering::SeqCst);
            }

            if record.status == SandboxStatus::Error {
                if let Some(err) = &record.error {
                    error!(folder = folder.as_str(), err = err.as_str(), "agent reported error");
                }
            }

            if record.status == SandboxStatus::Success {
                ctx.queue.notify_idle(&folder).await;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_resolution_from_prefix() {
        assert_eq!(channel_from_chat_id("tg:123"), "telegram");
        assert_eq!(channel_from_chat_id("dc:123"), "discord");
        assert_eq!(channel_from_chat_id("wa:123"), "whatsapp");
        assert_eq!(channel_from_chat_id("xx:123"), "unknown");
    }
}
