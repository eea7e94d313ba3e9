//! Observability hooks.
//!
//! Components report what happened as an [`Observation`] instead of logging
//! inline; [`TracingObserver`] turns those into log lines.

use std::sync::Mutex;
use std::time::Duration;

use nostr_core::{Addressing, DataEvent, DecryptionError};
use tracing::{debug, error, info, warn};

use crate::consumer::ConsumerState;
use crate::push::PushError;
use crate::registry::{ApplyReport, ControlPayloadError, SetUpdate, Transition};

/// Why a control message was dropped without touching the registry.
#[derive(Debug)]
pub enum ControlRejection<'a> {
    NotAddressed(&'a Addressing),
    Decryption(&'a DecryptionError),
    MalformedPayload(&'a ControlPayloadError),
}

#[derive(Debug)]
pub enum Observation<'a> {
    SubscriptionApplied(&'a ApplyReport),
    ControlRejected {
        event: &'a DataEvent,
        reason: ControlRejection<'a>,
    },
    EventRouted {
        event: &'a DataEvent,
        matched_filters: usize,
        identities: usize,
    },
    NoTokens {
        identity: &'a str,
        event_id: &'a str,
    },
    TokenRejected {
        token: &'a str,
    },
    BatchFailed {
        size: usize,
        error: &'a PushError,
    },
    Delivered {
        token: &'a str,
        ticket_id: Option<&'a str>,
    },
    DeliveryFailed {
        token: &'a str,
        message: &'a str,
        code: Option<&'a str>,
    },
    ConsumerState {
        from: ConsumerState,
        to: ConsumerState,
    },
    ReconnectScheduled {
        delay: Duration,
        error: &'a anyhow::Error,
    },
    ShutdownObserved,
    BootstrapLoaded {
        events: usize,
        applied: usize,
    },
    BootstrapFailed {
        error: &'a anyhow::Error,
    },
}

impl Observation<'_> {
    /// Stable short name, handy for metrics keys and assertions.
    pub fn label(&self) -> &'static str {
        match self {
            Observation::SubscriptionApplied(_) => "subscription_applied",
            Observation::ControlRejected { reason, .. } => match reason {
                ControlRejection::NotAddressed(_) => "control_not_addressed",
                ControlRejection::Decryption(_) => "control_decryption_failed",
                ControlRejection::MalformedPayload(_) => "control_malformed",
            },
            Observation::EventRouted { .. } => "event_routed",
            Observation::NoTokens { .. } => "no_tokens",
            Observation::TokenRejected { .. } => "token_rejected",
            Observation::BatchFailed { .. } => "batch_failed",
            Observation::Delivered { .. } => "delivered",
            Observation::DeliveryFailed { .. } => "delivery_failed",
            Observation::ConsumerState { .. } => "consumer_state",
            Observation::ReconnectScheduled { .. } => "reconnect_scheduled",
            Observation::ShutdownObserved => "shutdown_observed",
            Observation::BootstrapLoaded { .. } => "bootstrap_loaded",
            Observation::BootstrapFailed { .. } => "bootstrap_failed",
        }
    }
}

pub trait Observer: Send + Sync {
    fn observe(&self, observation: &Observation<'_>);
}

/// Production observer: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, observation: &Observation<'_>) {
        match observation {
            Observation::SubscriptionApplied(report) => log_applied(report),
            Observation::ControlRejected { event, reason } => match reason {
                ControlRejection::NotAddressed(addressing) => {
                    debug!(
                        event = %event.short_id(),
                        ?addressing,
                        "Control message not addressed to us"
                    );
                }
                ControlRejection::Decryption(e) => {
                    warn!(
                        event = %event.short_id(),
                        author = %event.pubkey,
                        "Decryption failed: {e}"
                    );
                }
                ControlRejection::MalformedPayload(e) => {
                    warn!(
                        event = %event.short_id(),
                        author = %event.pubkey,
                        "Ignoring control message: {e}"
                    );
                }
            },
            Observation::EventRouted {
                event,
                matched_filters,
                identities,
            } => {
                if *matched_filters == 0 {
                    debug!(event = %event.short_id(), kind = event.kind, "No filter matches");
                } else {
                    info!(
                        event = %event.short_id(),
                        kind = event.kind,
                        matched_filters,
                        identities,
                        "Event matched"
                    );
                }
            }
            Observation::NoTokens { identity, event_id } => {
                debug!(%identity, event = %event_id, "No push tokens registered, skipping");
            }
            Observation::TokenRejected { token } => {
                error!(%token, "Push token is not a valid Expo push token");
            }
            Observation::BatchFailed { size, error } => {
                error!(size, "Failed to send push batch: {error}");
            }
            Observation::Delivered { token, ticket_id } => {
                info!(%token, ticket = ticket_id.unwrap_or("-"), "Sent push");
            }
            Observation::DeliveryFailed {
                token,
                message,
                code,
            } => {
                error!(%token, code = code.unwrap_or("-"), "Push failed: {message}");
            }
            Observation::ConsumerState { from, to } => {
                info!(?from, ?to, "Queue consumer state");
            }
            Observation::ReconnectScheduled { delay, error } => {
                error!("Queue connection error: {error:#}, reconnecting in {delay:?}");
            }
            Observation::ShutdownObserved => {
                info!("Shutdown requested, queue consumer stopping");
            }
            Observation::BootstrapLoaded { events, applied } => {
                info!(events, applied, "Loaded subscriptions from relay history");
            }
            Observation::BootstrapFailed { error } => {
                warn!("Failed to read relay history: {error:#}. Continuing with empty registry");
            }
        }
    }
}

/// Keeps the label of every observation, in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    labels: Mutex<Vec<&'static str>>,
}

impl RecordingObserver {
    pub fn labels(&self) -> Vec<&'static str> {
        self.labels.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.labels().iter().filter(|l| **l == label).count()
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, observation: &Observation<'_>) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.push(observation.label());
        }
    }
}

fn log_applied(report: &ApplyReport) {
    for warning in &report.warnings {
        warn!(
            identity = %report.identity,
            field = ?warning.field,
            index = warning.index,
            "Skipping control entry: {}",
            warning.reason
        );
    }

    let verb = match report.transition {
        Transition::Created => "Registered new subscriber",
        Transition::Updated => "Updated subscriber",
    };
    let tokens = match report.tokens {
        SetUpdate::Replaced(n) => format!("{n} (replaced)"),
        SetUpdate::RetainedOnEmpty(n) => format!("{n} (kept, empty list received)"),
        SetUpdate::Unchanged(n) => format!("{n} (unchanged)"),
    };
    info!(
        identity = %report.identity,
        filters = report.filters.count(),
        tokens = %tokens,
        "{verb}"
    );
}
