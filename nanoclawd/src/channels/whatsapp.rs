//! WhatsApp transport: Cloud API webhook ingress, REST sends.
//!
//! Inbound messages arrive as webhook notifications on a small axum
//! listener (GET verification handshake + POST delivery). Outbound goes
//! through the Cloud API messages endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use nanoclaw_core::config::WhatsAppConfig;
use nanoclaw_core::store::Message;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{ChatBus, InboundEvent};

use super::{chunk_text, is_allowed};

pub const WHATSAPP_MAX_TEXT_CHARS: usize = 4096;
const GRAPH_API_BASE: &str = "https://graph.facebook.com/v19.0";

pub struct WhatsAppChannel {
    client: Client,
    access_token: Option<String>,
    config: WhatsAppConfig,
    stop_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct WebhookState {
    bus: Arc<ChatBus>,
    config: WhatsAppConfig,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let (stop_tx, _) = watch::channel(false);
        Self {
            client: Client::new(),
            access_token,
            config,
            stop_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.access_token.is_some()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn start(&self, bus: Arc<ChatBus>, shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }

        let state = WebhookState {
            bus,
            config: self.config.clone(),
        };
        let app = Router::new()
            .route("/webhook", get(verify_webhook).post(receive_webhook))
            .with_state(state);

        let bind = self.config.bind.clone();
        let mut shutdown = shutdown;
        let mut stopped = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(bind = bind.as_str(), err = %e, "whatsapp webhook bind failed");
                    return;
                }
            };
            info!(bind = bind.as_str(), "whatsapp webhook listening");

            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = stopped.changed() => {}
                    }
                    if *shutdown.borrow() || *stopped.borrow() {
                        return;
                    }
                }
            });
            if let Err(e) = serve.await {
                warn!(err = %e, "whatsapp webhook server exited");
            }
        });
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let Some(token) = self.access_token.as_deref() else {
            anyhow::bail!("whatsapp access token not configured");
        };
        let to = chat_id.strip_prefix("wa:").unwrap_or(chat_id);
        let url = format!("{GRAPH_API_BASE}/{}/messages", self.config.phone_number_id);

        for chunk in chunk_text(text, WHATSAPP_MAX_TEXT_CHARS) {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(token)
                .json(&serde_json::json!({
                    "messaging_product": "whatsapp",
                    "to": to,
                    "type": "text",
                    "text": { "body": chunk },
                }))
                .send()
                .await?;
            if !resp.status().is_success() {
                anyhow::bail!("whatsapp send failed: {}", resp.status());
            }
        }
        Ok(())
    }
}

/// GET handshake: echo the challenge when the verify token matches.
async fn verify_webhook(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == Some("subscribe") && token == Some(state.config.verify_token.as_str()) {
        (StatusCode::OK, challenge)
    } else {
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// POST delivery: unpack notification batches and publish allowed messages.
async fn receive_webhook(
    State(state): State<WebhookState>,
    axum::Json(body): axum::Json<Value>,
) -> StatusCode {
    for event in parse_webhook_events(&body) {
        if !is_allowed(&event.message.chat_id, &state.config.allowed_chats) {
            debug!(
                chat_id = event.message.chat_id.as_str(),
                "whatsapp chat not on allow-list, dropping"
            );
            continue;
        }
        state.bus.publish_inbound(event).await;
    }
    StatusCode::OK
}

/// Flatten a Cloud API notification body into inbound events.
pub fn parse_webhook_events(body: &Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let entries = body.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let value = match change.get("value") {
                Some(v) => v,
                None => continue,
            };

            // wa_id → profile name, for sender attribution.
            let mut names: HashMap<String, String> = HashMap::new();
            for contact in value
                .get("contacts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let (Some(wa_id), Some(name)) = (
                    contact.get("wa_id").and_then(Value::as_str),
                    contact
                        .pointer("/profile/name")
                        .and_then(Value::as_str),
                ) {
                    names.insert(wa_id.to_string(), name.to_string());
                }
            }

            for msg in value
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(from) = msg.get("from").and_then(Value::as_str) else {
                    continue;
                };
                let Some(body) = msg.pointer("/text/body").and_then(Value::as_str) else {
                    continue;
                };
                let id = msg.get("id").and_then(Value::as_str).unwrap_or_default();
                let timestamp = msg
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<i64>().ok())
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                    .unwrap_or_default()
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

                let sender_name = names
                    .get(from)
                    .cloned()
                    .unwrap_or_else(|| from.to_string());
                let chat_id = format!("wa:{from}");

                events.push(InboundEvent {
                    message: Message {
                        id: format!("wa-{id}"),
                        chat_id: chat_id.clone(),
                        channel: "whatsapp".into(),
                        sender_id: from.to_string(),
                        sender_name: sender_name.clone(),
                        content: body.to_string(),
                        timestamp,
                        is_from_me: false,
                    },
                    chat_name: sender_name,
                });
            }
        }
    }

    events
}
