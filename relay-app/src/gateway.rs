//! Event pipeline: dedup gate, validation, dispatch, delivery.

use crate::dedup::Deduplicator;
use crate::delivery::Deliverer;
use crate::dispatcher::{Dispatcher, Reply};
use relay_channels::{ContentError, InboundEvent, MessageType};

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No event id could be resolved.
    MissingEventId,
    /// Already claimed, or the claim could not be made.
    Duplicate,
    NotText,
    EmptyContent,
    MalformedContent,
    /// Dispatched, but there was nothing to say.
    NoReply,
    Delivered,
    DeliveryFailed,
}

#[derive(Clone)]
pub struct Gateway {
    dedup: Deduplicator,
    dispatcher: Dispatcher,
    deliverer: Deliverer,
}

impl Gateway {
    pub fn new(dedup: Deduplicator, dispatcher: Dispatcher, deliverer: Deliverer) -> Self {
        Self {
            dedup,
            dispatcher,
            deliverer,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(event_id = ?event.event_id.as_ref().map(|id| id.as_str())))]
    pub async fn handle_event(&self, event: InboundEvent) -> Outcome {
        let Some(event_id) = event.event_id.as_ref() else {
            tracing::error!("event without resolvable id; dropped");
            return Outcome::MissingEventId;
        };

        if !self.dedup.claim(event_id).await {
            return Outcome::Duplicate;
        }

        if event.message_type != MessageType::Text {
            tracing::warn!(message_type = event.message_type.as_str(), "ignoring non-text message");
            return Outcome::NotText;
        }

        let user_msg = match event.text() {
            Ok(text) if text.is_empty() => return Outcome::EmptyContent,
            Ok(text) => text,
            Err(ContentError::Empty) => {
                tracing::error!("empty message content");
                return Outcome::EmptyContent;
            }
            Err(e) => {
                tracing::error!(%e, "failed to parse message content");
                return Outcome::MalformedContent;
            }
        };

        let sender = event.recipient();
        let Some(reply) = self
            .dispatcher
            .dispatch(Some(event_id), &user_msg, sender.as_ref())
            .await
        else {
            return Outcome::NoReply;
        };

        // Resolved again from the payload rather than reusing the dispatch-time identity.
        let recipient = event.recipient();
        match reply {
            Reply::Text(text) => {
                if self.deliverer.deliver(&text, recipient.as_ref()).await {
                    Outcome::Delivered
                } else {
                    Outcome::DeliveryFailed
                }
            }
            Reply::Stream(fragments) => {
                if self
                    .deliverer
                    .deliver_stream(fragments, recipient.as_ref())
                    .await
                    > 0
                {
                    Outcome::Delivered
                } else {
                    Outcome::DeliveryFailed
                }
            }
        }
    }
}
