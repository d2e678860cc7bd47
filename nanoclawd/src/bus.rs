//! Chat bus: fans inbound messages out to subscribers and routes outbound
//! text back to the owning transport.
//!
//! Inbound handlers run sequentially in registration order and are isolated:
//! a failing handler never suppresses the ones after it. Outbound publishes
//! are awaited sequentially; a transport error is logged and swallowed. The
//! bus never retries.

use std::sync::Arc;

use futures::future::BoxFuture;
use nanoclaw_core::store::Message;
use tokio::sync::RwLock;
use tracing::{error, warn};

/// Inbound event: a persisted-shape message plus the chat's display name.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub message: Message,
    pub chat_name: String,
}

/// Outbound event: text bound for a chat. The target transport is derived
/// from the chat id namespace (`tg:`, `dc:`, `wa:`).
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub chat_id: String,
    pub text: String,
}

pub type InboundHandler =
    Arc<dyn Fn(InboundEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type OutboundHandler =
    Arc<dyn Fn(OutboundEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct ChatBus {
    inbound: RwLock<Vec<InboundHandler>>,
    outbound: RwLock<Vec<OutboundHandler>>,
}

impl ChatBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_inbound(&self, handler: InboundHandler) {
        self.inbound.write().await.push(handler);
    }

    pub async fn on_outbound(&self, handler: OutboundHandler) {
        self.outbound.write().await.push(handler);
    }

    /// Deliver an inbound event to every handler in registration order.
    pub async fn publish_inbound(&self, event: InboundEvent) {
        let handlers = self.inbound.read().await.clone();
        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                warn!(chat_id = event.message.chat_id.as_str(), err = %e, "inbound handler failed");
            }
        }
    }

    /// Route an outbound event to the registered senders, sequentially.
    pub async fn publish_outbound(&self, event: OutboundEvent) {
        let handlers = self.outbound.read().await.clone();
        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                error!(chat_id = event.chat_id.as_str(), err = %e, "outbound send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_event(chat_id: &str) -> InboundEvent {
        InboundEvent {
            message: Message {
                id: "m1".into(),
                chat_id: chat_id.into(),
                channel: "telegram".into(),
                sender_id: "u1".into(),
                sender_name: "Alice".into(),
                content: "hi".into(),
                timestamp: "2026-01-01T10:00:00.000Z".into(),
                is_from_me: false,
            },
            chat_name: "Test".into(),
        }
    }

    #[tokio::test]
    async fn inbound_handlers_run_in_registration_order() {
        let bus = ChatBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.on_inbound(Arc::new(move |_ev| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                })
            }))
            .await;
        }

        bus.publish_inbound(test_event("tg:1")).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_inbound_handler_does_not_suppress_later_ones() {
        let bus = ChatBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.on_inbound(Arc::new(|_ev| {
            Box::pin(async { anyhow::bail!("handler exploded") })
        }))
        .await;

        let reached_ref = reached.clone();
        bus.on_inbound(Arc::new(move |_ev| {
            let reached = reached_ref.clone();
            Box::pin(async move {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .await;

        bus.publish_inbound(test_event("tg:1")).await;
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outbound_error_is_swallowed() {
        let bus = ChatBus::new();
        bus.on_outbound(Arc::new(|_ev| {
            Box::pin(async { anyhow::bail!("network down") })
        }))
        .await;

        // Must not panic or propagate.
        bus.publish_outbound(OutboundEvent {
            chat_id: "tg:1".into(),
            text: "hello".into(),
        })
        .await;
    }
}
