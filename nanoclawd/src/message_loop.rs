//! Message poll loop: drives agents off the store with two cursors.
//!
//! - `last_ingest_cursor` (global) advances whenever a batch of new rows has
//!   been inspected, whether or not any agent ran. It only bounds the next
//!   fetch.
//! - `last_agent_cursor` (per chat) advances when messages actually reach an
//!   agent, and rolls back when the run fails. The gap between the two is a
//!   chat's missed window.
//!
//! On startup, `recover_pending` re-enqueues every chat whose newest message
//! is beyond its agent cursor, which replays anything lost to a crash
//! between ingest and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nanoclaw_core::error::Result;
use nanoclaw_core::store::{Message, RegisteredGroup, Store};
use regex::Regex;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::queue::GroupQueue;

const INGEST_CURSOR_KEY: &str = "last_ingest_cursor";
const AGENT_CURSOR_KEY: &str = "last_agent_cursor";

#[derive(Debug, Clone)]
pub struct MessageLoopConfig {
    pub poll_interval_ms: u64,
    pub assistant_name: String,
    pub main_folder: String,
    pub max_context_messages: usize,
}

pub type Groups = Arc<RwLock<HashMap<String, RegisteredGroup>>>;

// ---------------------------------------------------------------------------
// Cursor persistence
// ---------------------------------------------------------------------------

pub fn load_ingest_cursor(store: &Store) -> String {
    store
        .get_router_state(INGEST_CURSOR_KEY)
        .ok()
        .flatten()
        .unwrap_or_default()
}

pub fn save_ingest_cursor(store: &Store, value: &str) -> Result<()> {
    store.set_router_state(INGEST_CURSOR_KEY, value)
}

pub fn load_agent_cursors(store: &Store) -> HashMap<String, String> {
    store
        .get_router_state(AGENT_CURSOR_KEY)
        .ok()
        .flatten()
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

pub fn save_agent_cursors(store: &Store, cursors: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string(cursors).unwrap_or_else(|_| "{}".into());
    store.set_router_state(AGENT_CURSOR_KEY, &json)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the message poll loop until the shutdown signal fires.
pub async fn run_message_loop(
    config: MessageLoopConfig,
    store: Store,
    queue: Arc<GroupQueue>,
    groups: Groups,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(config.poll_interval_ms);
    let mut ingest_cursor = load_ingest_cursor(&store);

    info!(
        poll_interval_ms = config.poll_interval_ms,
        ingest_cursor = ingest_cursor.as_str(),
        "message loop started"
    );

    recover_pending(&config, &store, &queue, &groups).await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("message loop shutting down");
                    return;
                }
            }
        }

        match poll_once(&config, &store, &queue, &groups, &mut ingest_cursor).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(err = %e, "fatal storage error in message loop, aborting");
                std::process::exit(1);
            }
            Err(e) => {
                error!(err = %e, "error in message poll");
            }
        }
    }
}

/// One poll iteration. Extracted for tests.
pub async fn poll_once(
    config: &MessageLoopConfig,
    store: &Store,
    queue: &GroupQueue,
    groups: &Groups,
    ingest_cursor: &mut String,
) -> Result<()> {
    let groups_snapshot = groups.read().await.clone();
    if groups_snapshot.is_empty() {
        return Ok(());
    }

    let batch = store.messages_after(ingest_cursor)?;
    if batch.is_empty() {
        return Ok(());
    }
    debug!(count = batch.len(), "new messages");

    let batch_max = batch
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();

    let mut by_chat: HashMap<String, Vec<Message>> = HashMap::new();
    for msg in batch {
        by_chat.entry(msg.chat_id.clone()).or_default().push(msg);
    }

    let mut agent_cursors = load_agent_cursors(store);

    for (chat_id, new_messages) in by_chat {
        let Some(group) = groups_snapshot.get(&chat_id) else {
            continue;
        };

        let is_main = group.folder == config.main_folder;

        // Our own stored replies never count as fresh input.
        if new_messages.iter().all(|m| m.is_from_me) {
            continue;
        }

        // Non-main groups act only when a fresh message carries the trigger.
        // Everything else accumulates in the store until one does.
        if !is_main && group.requires_trigger {
            let re = build_trigger_regex(&config.assistant_name, &group.trigger_pattern);
            let triggered = new_messages
                .iter()
                .any(|m| !m.is_from_me && re.is_match(m.content.trim()));
            if !triggered {
                continue;
            }
        }

        let previous = agent_cursors.get(&chat_id).cloned();
        let window = truncate_window(
            store.messages_since(&chat_id, previous.as_deref().unwrap_or(""))?,
            config.max_context_messages,
        );
        let Some(last) = window.last() else {
            continue;
        };
        let window_max = last.timestamp.clone();
        let prompt = format_messages(&window);

        // Tentative advance; the pipe either takes it or we roll back and
        // let the queued processor manage its own advance/rollback cycle.
        agent_cursors.insert(chat_id.clone(), window_max);
        save_agent_cursors(store, &agent_cursors)?;

        if queue.send_message(&group.folder, &prompt).await {
            debug!(
                chat_id = chat_id.as_str(),
                count = window.len(),
                "piped window into live sandbox"
            );
        } else {
            match previous {
                Some(p) => agent_cursors.insert(chat_id.clone(), p),
                None => agent_cursors.remove(&chat_id),
            };
            save_agent_cursors(store, &agent_cursors)?;
            queue.enqueue_message_check(&group.folder).await;
        }
    }

    *ingest_cursor = batch_max;
    save_ingest_cursor(store, ingest_cursor)?;

    Ok(())
}

/// Startup recovery: re-trigger any chat whose newest message is past its
/// agent cursor.
pub async fn recover_pending(
    config: &MessageLoopConfig,
    store: &Store,
    queue: &GroupQueue,
    groups: &Groups,
) {
    let agent_cursors = load_agent_cursors(store);
    let groups_snapshot = groups.read().await.clone();

    for (chat_id, group) in &groups_snapshot {
        let since = agent_cursors.get(chat_id).cloned().unwrap_or_default();
        let pending = match store.messages_since(chat_id, &since) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(chat_id = chat_id.as_str(), err = %e, "recovery: failed to load pending");
                continue;
            }
        };
        if pending.iter().all(|m| m.is_from_me) {
            continue;
        }

        let is_main = group.folder == config.main_folder;
        if !is_main && group.requires_trigger {
            let re = build_trigger_regex(&config.assistant_name, &group.trigger_pattern);
            if !pending
                .iter()
                .any(|m| !m.is_from_me && re.is_match(m.content.trim()))
            {
                continue;
            }
        }

        info!(
            folder = group.folder.as_str(),
            pending = pending.len(),
            "recovery: enqueueing unprocessed messages"
        );
        queue.enqueue_message_check(&group.folder).await;
    }
}

// ---------------------------------------------------------------------------
// Window shaping
// ---------------------------------------------------------------------------

/// Keep the most recent `max` messages.
pub fn truncate_window(mut window: Vec<Message>, max: usize) -> Vec<Message> {
    if window.len() > max {
        window.drain(..window.len() - max);
    }
    window
}

/// Format a window as the agent prompt: one element per message, attribute
/// values and content escaped exactly once.
pub fn format_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                escape_xml(&m.timestamp),
                escape_xml(&m.content),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Escape `& < > " '` for attribute and content positions.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Compile a group's trigger. A custom pattern extends the default
/// `@AssistantName` mention; both are case-insensitive and anchored.
pub fn build_trigger_regex(assistant_name: &str, custom_pattern: &str) -> Regex {
    let mention = format!(r"(?i)^@{}\b", regex::escape(assistant_name));
    let pattern = if custom_pattern.is_empty() {
        mention.clone()
    } else {
        format!(r"(?i)^@{}\b|^(?:{})", regex::escape(assistant_name), custom_pattern)
    };

    Regex::new(&pattern).unwrap_or_else(|_| {
        warn!(pattern = custom_pattern, "invalid trigger pattern, using mention only");
        Regex::new(&mention).expect("mention regex is valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, content: &str, ts: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: "tg:1".into(),
            channel: "telegram".into(),
            sender_id: "u1".into(),
            sender_name: "Alice".into(),
            content: content.into(),
            timestamp: ts.into(),
            is_from_me: false,
        }
    }

    #[test]
    fn escape_covers_all_five_specials() {
        assert_eq!(escape_xml(r#"<a & "b" '>"#), "&lt;a &amp; &quot;b&quot; &#39;&gt;");
    }

    #[test]
    fn escape_is_not_idempotent() {
        let once = escape_xml("a & b");
        let twice = escape_xml(&once);
        assert_eq!(once, "a &amp; b");
        assert_eq!(twice, "a &amp;amp; b");
        assert_ne!(once, twice);
    }

    #[test]
    fn format_escapes_attributes_exactly_once() {
        let m = Message {
            sender_name: "A\"B".into(),
            ..msg("m1", "x < y", "2026-01-01T10:00:00.000Z")
        };
        let out = format_messages(&[m]);
        assert_eq!(
            out,
            "<message sender=\"A&quot;B\" time=\"2026-01-01T10:00:00.000Z\">x &lt; y</message>"
        );
    }

    #[test]
    fn format_joins_with_newlines() {
        let out = format_messages(&[
            msg("m1", "one", "2026-01-01T10:00:00.000Z"),
            msg("m2", "two", "2026-01-01T10:01:00.000Z"),
        ]);
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn truncation_boundaries() {
        let window: Vec<Message> = (0..100)
            .map(|i| msg(&format!("m{i}"), "x", &format!("2026-01-01T10:{:02}:00.000Z", i % 60)))
            .collect();

        // Exactly at the bound: untouched.
        assert_eq!(truncate_window(window.clone(), 100).len(), 100);

        // One above: exactly the oldest is dropped.
        let mut plus_one = window.clone();
        plus_one.push(msg("m100", "x", "2026-01-01T11:00:00.000Z"));
        let truncated = truncate_window(plus_one, 100);
        assert_eq!(truncated.len(), 100);
        assert_eq!(truncated[0].id, "m1");
        assert_eq!(truncated[99].id, "m100");
    }

    #[test]
    fn trigger_matches_mention_case_insensitively() {
        let re = build_trigger_regex("Andy", "");
        assert!(re.is_match("@Andy hi"));
        assert!(re.is_match("@andy hi"));
        assert!(!re.is_match("hi @Andy"));
        assert!(!re.is_match("@Andrea hi"));
    }

    #[test]
    fn trigger_custom_pattern_extends_mention() {
        let re = build_trigger_regex("Andy", "!ai\\b");
        assert!(re.is_match("@Andy hello"));
        assert!(re.is_match("!ai do something"));
        assert!(!re.is_match("say !ai"));
    }

    #[test]
    fn invalid_custom_pattern_falls_back_to_mention() {
        let re = build_trigger_regex("Andy", "((broken");
        assert!(re.is_match("@Andy hi"));
        assert!(!re.is_match("((broken"));
    }

    fn loop_config() -> MessageLoopConfig {
        MessageLoopConfig {
            poll_interval_ms: 100,
            assistant_name: "Andy".into(),
            main_folder: "main".into(),
            max_context_messages: 100,
        }
    }

    fn seeded_store(folder: &str, requires_trigger: bool) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_registered_group(&nanoclaw_core::store::RegisteredGroup {
                chat_id: "tg:1".into(),
                name: "Test".into(),
                folder: folder.into(),
                trigger_pattern: String::new(),
                added_at: nanoclaw_core::now_rfc3339(),
                container_config: None,
                requires_trigger,
            })
            .unwrap();
        store
    }

    fn groups_from(store: &Store) -> Groups {
        Arc::new(RwLock::new(store.get_registered_groups().unwrap()))
    }

    fn test_queue(dir: &std::path::Path) -> GroupQueue {
        GroupQueue::new(
            nanoclaw_core::config::QueueConfig::default(),
            nanoclaw_core::ipc::IpcPaths::new(dir),
        )
    }

    #[tokio::test]
    async fn empty_batch_changes_no_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store("f", true);
        let queue = test_queue(tmp.path());
        let groups = groups_from(&store);
        let mut ingest = String::new();

        poll_once(&loop_config(), &store, &queue, &groups, &mut ingest)
            .await
            .unwrap();

        assert_eq!(ingest, "");
        assert!(load_agent_cursors(&store).is_empty());
        assert!(!queue.is_active("f").await);
    }

    #[tokio::test]
    async fn untriggered_messages_accumulate_without_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store("f", true);
        let queue = test_queue(tmp.path());
        let groups = groups_from(&store);
        let mut ingest = String::new();

        store
            .store_message(&msg("m1", "just chatting", "2026-01-01T10:00:00.000Z"))
            .unwrap();

        poll_once(&loop_config(), &store, &queue, &groups, &mut ingest)
            .await
            .unwrap();

        // Inspected (ingest advanced) but not consumed (no agent cursor).
        assert_eq!(ingest, "2026-01-01T10:00:00.000Z");
        assert!(load_agent_cursors(&store).is_empty());
        assert!(!queue.is_active("f").await);
    }

    #[tokio::test]
    async fn trigger_mid_window_enqueues_with_cursor_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store("f", true);
        let queue = test_queue(tmp.path());
        let groups = groups_from(&store);
        let mut ingest = String::new();

        // Pre-trigger context, then the trigger itself.
        store
            .store_message(&msg("m1", "some context", "2026-01-01T10:00:00.000Z"))
            .unwrap();
        store
            .store_message(&msg("m2", "@Andy summarize", "2026-01-01T10:01:00.000Z"))
            .unwrap();

        poll_once(&loop_config(), &store, &queue, &groups, &mut ingest)
            .await
            .unwrap();

        // No live sandbox to pipe into: the chat is enqueued and the agent
        // cursor stays put so the processor re-reads the whole window,
        // pre-trigger context included.
        assert_eq!(ingest, "2026-01-01T10:01:00.000Z");
        assert!(load_agent_cursors(&store).is_empty());
        assert!(queue.is_active("f").await);
    }

    #[tokio::test]
    async fn idle_sandbox_gets_window_piped_and_cursor_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store("f", false);
        let queue = test_queue(tmp.path());
        let groups = groups_from(&store);
        let mut ingest = String::new();

        // Park the folder in idle-waiting with a (pretend) live sandbox.
        let release = Arc::new(tokio::sync::Notify::new());
        let release_fn = release.clone();
        queue
            .set_process_messages_fn(Arc::new(move |_folder: String| {
                let release = release_fn.clone();
                Box::pin(async move {
                    release.notified().await;
                    true
                })
            }))
            .await;
        queue.enqueue_message_check("f").await;
        while !queue.is_active("f").await {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let (activity_tx, _activity_rx) =
            tokio::sync::watch::channel(std::time::Instant::now());
        queue.register_process("f", "nanoclaw-f-1", activity_tx).await;
        queue.notify_idle("f").await;

        store
            .store_message(&msg("m1", "follow-up question", "2026-01-01T10:02:00.000Z"))
            .unwrap();

        poll_once(&loop_config(), &store, &queue, &groups, &mut ingest)
            .await
            .unwrap();

        // Piped, no second sandbox, cursor advanced to the piped window.
        let cursors = load_agent_cursors(&store);
        assert_eq!(
            cursors.get("tg:1").map(String::as_str),
            Some("2026-01-01T10:02:00.000Z")
        );

        let input_dir = nanoclaw_core::ipc::IpcPaths::new(tmp.path()).input_dir("f");
        let frames: Vec<_> = std::fs::read_dir(&input_dir)
            .unwrap()
            .flatten()
            .filter(|e| {
                nanoclaw_core::is_frame_file_name(&e.file_name().to_string_lossy())
            })
            .collect();
        assert_eq!(frames.len(), 1);
        let frame: nanoclaw_core::InputFrame =
            serde_json::from_str(&std::fs::read_to_string(frames[0].path()).unwrap()).unwrap();
        let nanoclaw_core::InputFrame::Message { text } = frame;
        assert!(text.contains("follow-up question"));
        assert!(text.contains("<message sender=\"Alice\""));

        release.notify_waiters();
    }

    #[test]
    fn cursor_roundtrip_through_store() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(load_ingest_cursor(&store), "");

        save_ingest_cursor(&store, "2026-01-01T10:00:00.000Z").unwrap();
        assert_eq!(load_ingest_cursor(&store), "2026-01-01T10:00:00.000Z");

        let mut cursors = HashMap::new();
        cursors.insert("tg:1".to_string(), "2026-01-01T10:00:00.000Z".to_string());
        save_agent_cursors(&store, &cursors).unwrap();
        assert_eq!(load_agent_cursors(&store), cursors);
    }
}
