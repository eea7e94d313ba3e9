//! Per-message handling: control messages update the registry, everything
//! else is matched and pushed.

use std::sync::Arc;

use nostr_core::{ControlGate, DataEvent};
use serde::Deserialize;
use tracing::debug;

use crate::dispatch::NotificationDispatcher;
use crate::observer::{ControlRejection, Observation, Observer};
use crate::registry::SubscriptionRegistry;
use crate::router::route;

/// Body of every message on the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueEnvelope {
    pub event: DataEvent,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(rename = "receivedAt", default)]
    pub received_at: Option<serde_json::Number>,
    #[serde(rename = "sourceInfo", default)]
    pub source_info: String,
}

/// The only failure that makes a delivery go back to the queue.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("malformed queue message: {0}")]
    Envelope(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    NotAddressed,
    DecryptionFailed,
    MalformedPayload,
}

/// A message that was handled and may be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Control(ControlOutcome),
    /// Data event; `notified` identities had tokens and were dispatched to.
    Data { matched: usize, notified: usize },
}

pub struct NotificationService {
    gate: ControlGate,
    registry: SubscriptionRegistry,
    dispatcher: NotificationDispatcher,
    observer: Arc<dyn Observer>,
}

impl NotificationService {
    pub fn new(
        gate: ControlGate,
        dispatcher: NotificationDispatcher,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            gate,
            registry: SubscriptionRegistry::new(),
            dispatcher,
            observer,
        }
    }

    pub fn identity(&self) -> &str {
        self.gate.identity()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Handle one raw queue message body.
    ///
    /// `Err` only for a body that is not a queue envelope; every other
    /// problem is observed and the message counts as handled.
    pub async fn handle_message(&mut self, body: &[u8]) -> Result<Handled, ProcessingError> {
        let envelope: QueueEnvelope = serde_json::from_slice(body)?;
        debug!(
            event = %envelope.event.short_id(),
            kind = envelope.event.kind,
            source = %envelope.source_info,
            "Received queue message"
        );

        if envelope.event.is_control() {
            return Ok(Handled::Control(self.apply_control_event(&envelope.event)));
        }
        Ok(self.route_event(&envelope.event).await)
    }

    /// Gate, decrypt and apply a control event from the queue or relay history.
    pub fn apply_control_event(&mut self, event: &DataEvent) -> ControlOutcome {
        let addressing = self.gate.addressing(event);
        if !addressing.is_for_me() {
            self.reject(event, ControlRejection::NotAddressed(&addressing));
            return ControlOutcome::NotAddressed;
        }

        let plaintext = match self.gate.decrypt(&event.content, &event.pubkey) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.reject(event, ControlRejection::Decryption(&e));
                return ControlOutcome::DecryptionFailed;
            }
        };

        match self.registry.apply_control_message(&event.pubkey, &plaintext) {
            Ok(report) => {
                self.observer
                    .observe(&Observation::SubscriptionApplied(&report));
                ControlOutcome::Applied
            }
            Err(e) => {
                self.reject(event, ControlRejection::MalformedPayload(&e));
                ControlOutcome::MalformedPayload
            }
        }
    }

    /// Replay control events collected from relay history. Returns how many applied.
    pub fn bootstrap<'a>(&mut self, events: impl IntoIterator<Item = &'a DataEvent>) -> usize {
        let mut seen = 0;
        let mut applied = 0;
        for event in events {
            if !event.is_control() {
                continue;
            }
            seen += 1;
            if self.apply_control_event(event) == ControlOutcome::Applied {
                applied += 1;
            }
        }
        self.observer.observe(&Observation::BootstrapLoaded {
            events: seen,
            applied,
        });
        applied
    }

    /// Apply the outcome of a relay history read. A failed read is observed
    /// and the service carries on with whatever is registered.
    pub fn bootstrap_from(&mut self, loaded: anyhow::Result<Vec<DataEvent>>) -> usize {
        match loaded {
            Ok(events) => self.bootstrap(&events),
            Err(error) => {
                self.observer
                    .observe(&Observation::BootstrapFailed { error: &error });
                0
            }
        }
    }

    /// Match a data event against the registry and push to every matching
    /// identity that has tokens.
    pub async fn route_event(&self, event: &DataEvent) -> Handled {
        let routing = route(event, &self.registry);
        self.observer.observe(&Observation::EventRouted {
            event,
            matched_filters: routing.matched_filters,
            identities: routing.identities.len(),
        });

        let mut notified = 0;
        for identity in &routing.identities {
            let Some(tokens) = self.registry.tokens_for(identity) else {
                self.observer.observe(&Observation::NoTokens {
                    identity,
                    event_id: &event.id,
                });
                continue;
            };
            self.dispatcher.dispatch(tokens, event).await;
            notified += 1;
        }

        Handled::Data {
            matched: routing.identities.len(),
            notified,
        }
    }

    fn reject(&self, event: &DataEvent, reason: ControlRejection<'_>) {
        self.observer
            .observe(&Observation::ControlRejected { event, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::push::{PushError, PushMessage, PushSender, PushTicket};
    use async_trait::async_trait;
    use nostr_core::nostr_sdk::nips::nip04;
    use nostr_core::nostr_sdk::Keys;
    use nostr_core::KIND_APP_DATA;

    struct OkSender;

    #[async_trait]
    impl PushSender for OkSender {
        async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError> {
            Ok(messages.iter().map(|_| PushTicket::Ok { id: None }).collect())
        }
    }

    fn service(keys: &Keys) -> (NotificationService, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let dispatcher = NotificationDispatcher::new(Arc::new(OkSender), observer.clone());
        let service =
            NotificationService::new(ControlGate::new(keys.clone()), dispatcher, observer.clone());
        (service, observer)
    }

    fn control(sender: &Keys, recipient: &Keys, plaintext: &str) -> DataEvent {
        let content =
            nip04::encrypt(sender.secret_key(), &recipient.public_key(), plaintext).unwrap();
        DataEvent {
            id: "ctl".into(),
            pubkey: sender.public_key().to_hex(),
            created_at: 0,
            kind: KIND_APP_DATA,
            tags: vec![vec!["p".into(), recipient.public_key().to_hex()]],
            content,
            sig: String::new(),
        }
    }

    fn envelope(event: &DataEvent) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event": event,
            "type": "event",
            "receivedAt": 1700000000123u64,
            "sourceInfo": "test"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_processing_error() {
        let (mut svc, _) = service(&Keys::generate());
        assert!(svc.handle_message(b"not json").await.is_err());
        assert!(svc.handle_message(br#"{"type":"event"}"#).await.is_err());
    }

    #[tokio::test]
    async fn control_then_data_event_dispatches() {
        let me = Keys::generate();
        let user = Keys::generate();
        let (mut svc, observer) = service(&me);

        let ctl = control(
            &user,
            &me,
            r#"{"filters":[{"filter":{"kinds":[1]}}],"tokens":[{"token":"ExpoPushToken[u]"}]}"#,
        );
        let handled = svc.handle_message(&envelope(&ctl)).await.unwrap();
        assert_eq!(handled, Handled::Control(ControlOutcome::Applied));

        let note = DataEvent {
            id: "n1".into(),
            pubkey: "someone".into(),
            created_at: 5,
            kind: 1,
            tags: vec![],
            content: "hello".into(),
            sig: String::new(),
        };
        let handled = svc.handle_message(&envelope(&note)).await.unwrap();
        assert_eq!(handled, Handled::Data { matched: 1, notified: 1 });
        assert_eq!(observer.count("delivered"), 1);
    }

    #[tokio::test]
    async fn undecryptable_control_is_handled_without_state_change() {
        let me = Keys::generate();
        let user = Keys::generate();
        let (mut svc, observer) = service(&me);

        let mut ctl = control(&user, &me, r#"{"filters":[]}"#);
        ctl.content = "bm90IGNpcGhlcg==?iv=AAAAAAAAAAAAAAAAAAAAAA==".into();
        let handled = svc.handle_message(&envelope(&ctl)).await.unwrap();
        assert_eq!(handled, Handled::Control(ControlOutcome::DecryptionFailed));
        assert!(svc.registry().is_empty());
        assert_eq!(observer.count("control_decryption_failed"), 1);
    }

    #[tokio::test]
    async fn control_for_someone_else_is_ignored() {
        let me = Keys::generate();
        let other = Keys::generate();
        let user = Keys::generate();
        let (mut svc, _) = service(&me);

        let ctl = control(&user, &other, r#"{"filters":[]}"#);
        let handled = svc.handle_message(&envelope(&ctl)).await.unwrap();
        assert_eq!(handled, Handled::Control(ControlOutcome::NotAddressed));
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn matched_identity_without_tokens_is_skipped() {
        let me = Keys::generate();
        let user = Keys::generate();
        let (mut svc, observer) = service(&me);

        svc.apply_control_event(&control(&user, &me, r#"{"filters":[{"filter":{}}]}"#));
        let note = DataEvent {
            id: "n1".into(),
            pubkey: "a".into(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let handled = svc.route_event(&note).await;
        assert_eq!(handled, Handled::Data { matched: 1, notified: 0 });
        assert_eq!(observer.count("no_tokens"), 1);
    }

    #[tokio::test]
    async fn failed_history_read_leaves_registry_empty_and_keeps_serving() {
        let me = Keys::generate();
        let user = Keys::generate();
        let (mut svc, observer) = service(&me);

        let applied = svc.bootstrap_from(Err(anyhow::anyhow!("relay unreachable")));
        assert_eq!(applied, 0);
        assert!(svc.registry().is_empty());
        assert_eq!(observer.labels(), vec!["bootstrap_failed"]);

        let ctl = control(&user, &me, r#"{"filters":[{"filter":{"kinds":[1]}}]}"#);
        let handled = svc.handle_message(&envelope(&ctl)).await.unwrap();
        assert_eq!(handled, Handled::Control(ControlOutcome::Applied));
        assert_eq!(svc.registry().identity_count(), 1);
    }

    #[test]
    fn successful_history_read_is_replayed() {
        let me = Keys::generate();
        let user = Keys::generate();
        let (mut svc, observer) = service(&me);

        let events = vec![control(&user, &me, r#"{"filters":[{"filter":{}}]}"#)];
        assert_eq!(svc.bootstrap_from(Ok(events)), 1);
        assert_eq!(observer.count("bootstrap_failed"), 0);
        assert_eq!(observer.count("bootstrap_loaded"), 1);
    }

    #[test]
    fn bootstrap_replays_only_control_events() {
        let me = Keys::generate();
        let a = Keys::generate();
        let b = Keys::generate();
        let (mut svc, observer) = service(&me);

        let mut note = control(&a, &me, "{}");
        note.kind = 1;
        let events = vec![
            control(&a, &me, r#"{"filters":[{"filter":{"kinds":[1]}}]}"#),
            note,
            control(&b, &me, "not json"),
        ];
        assert_eq!(svc.bootstrap(&events), 1);
        assert_eq!(svc.registry().identity_count(), 1);
        assert_eq!(observer.count("bootstrap_loaded"), 1);
        assert_eq!(observer.count("control_malformed"), 1);
    }
}
