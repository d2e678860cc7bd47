//! Chat transports.
//!
//! Every transport supports the same capability set: start ingress, stop
//! ingress, send text. Dispatch is a plain enum match, no trait objects.
//! Chat ids are namespaced by transport (`tg:`, `dc:`, `wa:`) so the
//! outbound router can pick the owner from the id alone.

pub mod discord;
pub mod telegram;
pub mod whatsapp;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::bus::{ChatBus, OutboundEvent};

pub use discord::DiscordChannel;
pub use telegram::TelegramChannel;
pub use whatsapp::WhatsAppChannel;

/// A configured chat transport.
pub enum Transport {
    Telegram(TelegramChannel),
    Discord(DiscordChannel),
    WhatsApp(WhatsAppChannel),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Telegram(_) => "telegram",
            Transport::Discord(_) => "discord",
            Transport::WhatsApp(_) => "whatsapp",
        }
    }

    /// True when the transport is enabled AND has its credentials.
    pub fn is_configured(&self) -> bool {
        match self {
            Transport::Telegram(t) => t.is_enabled(),
            Transport::Discord(d) => d.is_enabled(),
            Transport::WhatsApp(w) => w.is_enabled(),
        }
    }

    /// Chat id namespace prefix owned by this transport.
    pub fn prefix(&self) -> &'static str {
        match self {
            Transport::Telegram(_) => "tg:",
            Transport::Discord(_) => "dc:",
            Transport::WhatsApp(_) => "wa:",
        }
    }

    /// Begin ingress. Inbound messages surface on the bus; the loop exits
    /// when either the transport is stopped or the daemon shuts down.
    pub async fn start(&self, bus: Arc<ChatBus>, shutdown: watch::Receiver<bool>) {
        match self {
            Transport::Telegram(t) => t.start(bus, shutdown).await,
            Transport::Discord(d) => d.start(bus, shutdown).await,
            Transport::WhatsApp(w) => w.start(bus, shutdown).await,
        }
    }

    /// Close ingress for this transport only.
    pub fn stop(&self) {
        match self {
            Transport::Telegram(t) => t.stop(),
            Transport::Discord(d) => d.stop(),
            Transport::WhatsApp(w) => w.stop(),
        }
    }

    pub async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        match self {
            Transport::Telegram(t) => t.send(chat_id, text).await,
            Transport::Discord(d) => d.send(chat_id, text).await,
            Transport::WhatsApp(w) => w.send(chat_id, text).await,
        }
    }
}

/// Register the outbound router: each published event goes to the transport
/// owning the chat id's namespace. Unroutable ids are logged and dropped.
pub async fn register_outbound_router(bus: &ChatBus, transports: Arc<Vec<Transport>>) {
    bus.on_outbound(Arc::new(move |event: OutboundEvent| {
        let transports = transports.clone();
        Box::pin(async move {
            let Some(transport) = transports
                .iter()
                .find(|t| event.chat_id.starts_with(t.prefix()))
            else {
                warn!(chat_id = event.chat_id.as_str(), "no transport for chat id");
                return Ok(());
            };
            transport
                .send(&event.chat_id, &event.text)
                .await
                .map_err(|e| {
                    nanoclaw_core::Error::Channel {
                        channel: transport.kind().to_string(),
                        detail: e.to_string(),
                    }
                    .into()
                })
        })
    }))
    .await;
}

/// Exact-match allow-list check used by every transport before publishing
/// an inbound event. An empty list admits nothing.
pub fn is_allowed(chat_id: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|a| a == chat_id)
}

/// Split `text` into chunks of at most `max` characters, preferring to break
/// at the last newline (then space) inside the window.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    assert!(max > 0);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let chars: Vec<(usize, char)> = rest.char_indices().take(max + 1).collect();
        if chars.len() <= max {
            chunks.push(rest.to_string());
            break;
        }

        // Byte offset of the first char past the window.
        let window_end = chars[max].0;
        let window = &rest[..window_end];

        let break_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        chunks.push(rest[..break_at].to_string());
        rest = rest[break_at..].trim_start_matches(['\n', ' ']);
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}
