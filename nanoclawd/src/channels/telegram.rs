//! Telegram transport: Bot API long-polling ingress, chunked sends.

use std::sync::Arc;

use nanoclaw_core::config::TelegramConfig;
use nanoclaw_core::store::Message;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{ChatBus, InboundEvent};

use super::{chunk_text, is_allowed};

pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

pub struct TelegramChannel {
    client: Client,
    bot_token: Option<String>,
    config: TelegramConfig,
    stop_tx: watch::Sender<bool>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    pub message: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub date: i64,
    pub text: Option<String>,
    pub chat: TgChat,
    pub from: Option<TgUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    pub title: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let (stop_tx, _) = watch::channel(false);
        Self {
            client: Client::new(),
            bot_token,
            config,
            stop_tx,
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
                warn!("telegram enabled but TELEGRAM_BOT_TOKEN is unset; ingress disabled");
            }
            return;
        };
        if !self.config.enabled {
            return;
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let mut stopped = self.stop_tx.subscribe();

        tokio::spawn(async move {
            info!("telegram ingress started");
            let mut offset: i64 = 0;

            loop {
                if *shutdown.borrow() || *stopped.borrow() {
                    info!("telegram ingress stopped");
                    return;
                }

                let url = format!(
                    "{TELEGRAM_API_BASE}/bot{token}/getUpdates?timeout={}&offset={}",
                    config.poll_timeout_secs, offset
                );

                let poll = tokio::select! {
                    r = client.get(&url).send() => r,
                    _ = shutdown.changed() => continue,
                    _ = stopped.changed() => continue,
                };

                let updates: Vec<TgUpdate> = match poll {
                    Ok(resp) => match resp.json::<ApiEnvelope<Vec<TgUpdate>>>().await {
                        Ok(env) if env.ok => env.result.unwrap_or_default(),
                        Ok(env) => {
                            warn!(
                                description = env.description.as_deref().unwrap_or("unknown"),
                                "getUpdates rejected"
                            );
                            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                            continue;
                        }
                        Err(e) => {
                            warn!(err = %e, "getUpdates returned malformed body");
                            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(err = %e, "getUpdates request failed");
                        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(event) = update_to_event(&update) else {
                        continue;
                    };
                    if !is_allowed(&event.message.chat_id, &config.allowed_chats) {
                        debug!(
                            chat_id = event.message.chat_id.as_str(),
                            "telegram chat not on allow-list, dropping"
                        );
                        continue;
                    }
                    bus.publish_inbound(event).await;
                }
            }
        });
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let Some(token) = self.bot_token.as_deref() else {
            anyhow::bail!("telegram bot token not configured");
        };
        let raw_id = chat_id.strip_prefix("tg:").unwrap_or(chat_id);
        let url = format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage");

        for chunk in chunk_text(text, TELEGRAM_MAX_TEXT_CHARS) {
            let resp = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "chat_id": raw_id, "text": chunk }))
                .send()
                .await?;
            let env: ApiEnvelope<serde_json::Value> = resp.json().await?;
            if !env.ok {
                anyhow::bail!(
                    "sendMessage failed: {}",
                    env.description.unwrap_or_else(|| "unknown".into())
                );
            }
        }
        Ok(())
    }
}

/// Map a Telegram update to an inbound event. Non-text updates map to None.
pub fn update_to_event(update: &TgUpdate) -> Option<InboundEvent> {
    let msg = update.message.as_ref()?;
    let text = msg.text.as_deref()?.to_string();

    let chat_id = format!("tg:{}", msg.chat.id);
    let chat_name = msg
        .chat
        .title
        .clone()
        .or_else(|| msg.chat.first_name.clone())
        .unwrap_or_else(|| chat_id.clone());

    let (sender_id, sender_name, is_bot) = match &msg.from {
        Some(user) => (
            user.id.to_string(),
            user.first_name
                .clone()
                .or_else(|| user.username.clone())
                .unwrap_or_else(|| user.id.to_string()),
            user.is_bot,
        ),
        None => (String::new(), "unknown".to_string(), false),
    };

    let timestamp = chrono::DateTime::from_timestamp(msg.date, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    Some(InboundEvent {
        message: Message {
            id: format!("tg-{}-{}", msg.chat.id, msg.message_id),
            chat_id,
            channel: "telegram".into(),
            sender_id,
            sender_name,
            content: text,
            timestamp,
            is_from_me: is_bot,
        },
        chat_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(text: Option<&str>) -> TgUpdate {
        TgUpdate {
            update_id: 42,
            message: Some(TgMessage {
                message_id: 7,
                date: 1767261600, // 2026-01-01T10:00:00Z
                text: text.map(String::from),
                chat: TgChat {
                    id: -100123,
                    title: Some("Engineering".into()),
                    first_name: None,
                },
                from: Some(TgUser {
                    id: 555,
                    first_name: Some("Alice".into()),
                    username: Some("alice".into()),
                    is_bot: false,
                }),
            }),
        }
    }

    #[test]
    fn update_maps_to_namespaced_event() {
        let event = update_to_event(&sample_update(Some("@Andy hi"))).unwrap();
        assert_eq!(event.message.chat_id, "tg:-100123");
        assert_eq!(event.message.channel, "telegram");
        assert_eq!(event.message.sender_name, "Alice");
        assert_eq!(event.message.content, "@Andy hi");
        assert_eq!(event.chat_name, "Engineering");
        assert!(!event.message.is_from_me);
        assert!(event.message.timestamp.starts_with("2026-01-01T10:00:00"));
    }

    #[test]
    fn non_text_update_is_skipped() {
        assert!(update_to_event(&sample_update(None)).is_none());
        assert!(
            update_to_event(&TgUpdate {
                update_id: 1,
                message: None
            })
            .is_none()
        );
    }

    #[test]
    fn parses_bot_api_payload() {
        let json = r#"{
            "update_id": 10,
            "message": {
                "message_id": 2,
                "date": 1767261600,
                "text": "hello",
                "chat": {"id": 99, "first_name": "Bob"},
                "from": {"id": 99, "first_name": "Bob", "is_bot": false}
            }
        }"#;
        let update: TgUpdate = serde_json::from_str(json).unwrap();
        let event = update_to_event(&update).unwrap();
        assert_eq!(event.message.chat_id, "tg:99");
        assert_eq!(event.chat_name, "Bob");
    }
}
