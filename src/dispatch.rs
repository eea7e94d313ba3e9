//! Turns a matched event into push notifications for one subscriber's tokens.

use std::sync::Arc;

use nostr_core::DataEvent;

use crate::observer::{Observation, Observer};
use crate::push::{is_expo_push_token, PushData, PushError, PushMessage, PushSender, PushTicket};

/// Default body length, in characters.
pub const BODY_CHAR_BUDGET: usize = 80;

pub const UNKNOWN_LOCATION: &str = "unknown";

/// Location code from the first `l` / `#l` tag.
pub fn location_code(event: &DataEvent) -> &str {
    event
        .first_tag_value(&["l", "#l"])
        .unwrap_or(UNKNOWN_LOCATION)
}

pub fn notification_title(event: &DataEvent) -> String {
    format!("New note in plus code {}", location_code(event))
}

/// Cut `text` to `max` characters, appending `…` when something was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}

/// Per-call tally, mostly for tests; every outcome is also reported to the observer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub rejected_tokens: usize,
    pub failed_batches: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    sender: Arc<dyn PushSender>,
    observer: Arc<dyn Observer>,
    body_chars: usize,
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn PushSender>, observer: Arc<dyn Observer>) -> Self {
        Self {
            sender,
            observer,
            body_chars: BODY_CHAR_BUDGET,
        }
    }

    pub fn with_body_chars(mut self, body_chars: usize) -> Self {
        self.body_chars = body_chars;
        self
    }

    pub fn build_message(&self, token: &str, event: &DataEvent) -> PushMessage {
        PushMessage {
            to: token.to_string(),
            sound: "default".to_string(),
            title: notification_title(event),
            body: truncate_chars(&event.content, self.body_chars),
            data: PushData {
                id: event.id.clone(),
                kind: event.kind.to_string(),
                pubkey: event.pubkey.clone(),
                content: event.content.clone(),
                created_at: event.created_at.to_string(),
                tags: serde_json::to_string(&event.tags).unwrap_or_else(|_| "[]".to_string()),
            },
            priority: "default".to_string(),
        }
    }

    /// Push `event` to every valid token. Never fails; outcomes are observed
    /// and tallied. No retries.
    pub async fn dispatch(&self, tokens: &[String], event: &DataEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        let mut messages = Vec::with_capacity(tokens.len());
        for token in tokens {
            if !is_expo_push_token(token) {
                self.observer
                    .observe(&Observation::TokenRejected { token });
                report.rejected_tokens += 1;
                continue;
            }
            messages.push(self.build_message(token, event));
        }

        for batch in messages.chunks(self.sender.max_batch_size().max(1)) {
            let tickets = match self.sender.send_batch(batch).await {
                Ok(tickets) => tickets,
                Err(error) => {
                    self.observer.observe(&Observation::BatchFailed {
                        size: batch.len(),
                        error: &error,
                    });
                    report.failed_batches += 1;
                    continue;
                }
            };

            if tickets.len() < batch.len() {
                let error = PushError::MissingTickets {
                    sent: batch.len(),
                    got: tickets.len(),
                };
                self.observer.observe(&Observation::BatchFailed {
                    size: batch.len() - tickets.len(),
                    error: &error,
                });
                report.failed_batches += 1;
            }

            // Tickets come back in request order.
            for (message, ticket) in batch.iter().zip(&tickets) {
                match ticket {
                    PushTicket::Ok { id } => {
                        self.observer.observe(&Observation::Delivered {
                            token: &message.to,
                            ticket_id: id.as_deref(),
                        });
                        report.delivered += 1;
                    }
                    PushTicket::Error { message: reason, details } => {
                        self.observer.observe(&Observation::DeliveryFailed {
                            token: &message.to,
                            message: reason,
                            code: details.as_ref().and_then(|d| d.error.as_deref()),
                        });
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }
}
