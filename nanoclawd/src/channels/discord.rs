//! Discord transport: REST polling ingress, chunked sends.
//!
//! Polls `GET /channels/{id}/messages?after=` per configured channel instead
//! of holding a gateway websocket; the daemon's 2 s cadence is well inside
//! the REST rate budget for the handful of channels a deployment watches.

use std::collections::HashMap;
use std::sync::Arc;

use nanoclaw_core::config::DiscordConfig;
use nanoclaw_core::store::Message;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::bus::{ChatBus, InboundEvent};

use super::{chunk_text, is_allowed};

pub const DISCORD_MAX_TEXT_CHARS: usize = 2000;
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordChannel {
    client: Client,
    bot_token: Option<String>,
    config: DiscordConfig,
    stop_tx: watch::Sender<bool>,
    /// Last seen message snowflake per polled channel.
    cursors: Arc<Mutex<HashMap<String, String>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcMessage {
    pub id: String,
    pub channel_id: String,
    pub content: String,
    pub timestamp: String,
    pub author: DcAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcAuthor {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig) -> Self {
        let bot_token = std::env::var("DISCORD_BOT_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let (stop_tx, _) = watch::channel(false);
        Self {
            client: Client::new(),
            bot_token,
            config,
            stop_tx,
            cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.bot_token.is_some()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn start(&self, bus: Arc<ChatBus>, mut shutdown: watch::Receiver<bool>) {
        let Some(token) = self.bot_token.clone() else {
            if self.config.enabled {
                warn!("discord enabled but DISCORD_BOT_TOKEN is unset; ingress disabled");
            }
            return;
        };
        if !self.config.enabled {
            return;
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let cursors = self.cursors.clone();
        let mut stopped = self.stop_tx.subscribe();

        tokio::spawn(async move {
            info!(channels = config.channel_ids.len(), "discord ingress started");
            let interval = std::time::Duration::from_millis(config.poll_interval_ms);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                    _ = stopped.changed() => {}
                }
                if *shutdown.borrow() || *stopped.borrow() {
                    info!("discord ingress stopped");
                    return;
                }

                for channel_id in &config.channel_ids {
                    let after = cursors.lock().await.get(channel_id).cloned();
                    let mut url =
                        format!("{DISCORD_API_BASE}/channels/{channel_id}/messages?limit=100");
                    if let Some(after) = &after {
                        url.push_str(&format!("&after={after}"));
                    }

                    let resp = client
                        .get(&url)
                        .header("Authorization", format!("Bot {token}"))
                        .send()
                        .await;

                    let mut messages: Vec<DcMessage> = match resp {
                        Ok(r) if r.status().is_success() => {
                            r.json().await.unwrap_or_default()
                        }
                        Ok(r) => {
                            warn!(channel_id, status = %r.status(), "discord poll rejected");
                            continue;
                        }
                        Err(e) => {
                            warn!(channel_id, err = %e, "discord poll failed");
                            continue;
                        }
                    };

                    // API returns newest first; deliver oldest first.
                    messages.sort_by(|a, b| a.id.len().cmp(&b.id.len()).then(a.id.cmp(&b.id)));

                    for msg in messages {
                        {
                            let mut c = cursors.lock().await;
                            c.insert(channel_id.clone(), msg.id.clone());
                        }

                        // First poll has no cursor; it only seeds the position.
                        if after.is_none() {
                            continue;
                        }

                        let event = message_to_event(&msg);
                        if !is_allowed(&event.message.chat_id, &config.allowed_chats) {
                            debug!(
                                chat_id = event.message.chat_id.as_str(),
                                "discord channel not on allow-list, dropping"
                            );
                            continue;
                        }
                        bus.publish_inbound(event).await;
                    }
                }
            }
        });
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let Some(token) = self.bot_token.as_deref() else {
            anyhow::bail!("discord bot token not configured");
        };
        let channel_id = chat_id.strip_prefix("dc:").unwrap_or(chat_id);
        let url = format!("{DISCORD_API_BASE}/channels/{channel_id}/messages");

        for chunk in chunk_text(text, DISCORD_MAX_TEXT_CHARS) {
            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bot {token}"))
                .json(&serde_json::json!({ "content": chunk }))
                .send()
                .await?;
            if !resp.status().is_success() {
                anyhow::bail!("discord send failed: {}", resp.status());
            }
        }
        Ok(())
    }
}

/// Map a Discord REST message to an inbound event.
pub fn message_to_event(msg: &DcMessage) -> InboundEvent {
    let chat_id = format!("dc:{}", msg.channel_id);
    InboundEvent {
        message: Message {
            id: format!("dc-{}", msg.id),
            chat_id: chat_id.clone(),
            channel: "discord".into(),
            sender_id: msg.author.id.clone(),
            sender_name: msg.author.username.clone(),
            content: msg.content.clone(),
            timestamp: msg.timestamp.clone(),
            is_from_me: msg.author.bot,
        },
        chat_name: chat_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_message_maps_to_event() {
        let json = r#"{
            "id": "1112223334445556667",
            "channel_id": "999888777",
            "content": "@Andy status?",
            "timestamp": "2026-01-01T10:00:00.000000+00:00",
            "author": {"id": "123", "username": "alice", "bot": false}
        }"#;
        let msg: DcMessage = serde_json::from_str(json).unwrap();
        let event = message_to_event(&msg);
        assert_eq!(event.message.chat_id, "dc:999888777");
        assert_eq!(event.message.channel, "discord");
        assert_eq!(event.message.sender_name, "alice");
        assert!(!event.message.is_from_me);
    }

    #[test]
    fn bot_author_marks_is_from_me() {
        let msg = DcMessage {
            id: "1".into(),
            channel_id: "2".into(),
            content: "reply".into(),
            timestamp: "2026-01-01T10:00:00Z".into(),
            author: DcAuthor {
                id: "3".into(),
                username: "nanoclaw".into(),
                bot: true,
            },
        };
        assert!(message_to_event(&msg).message.is_from_me);
    }
}
