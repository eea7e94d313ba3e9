//! Per-subscriber state: which events an identity wants and where to push them.
//!
//! Control messages replace an identity's filters and tokens wholesale. The
//! two sets differ in one respect: an explicitly empty `tokens` list keeps the
//! previously registered tokens, while an explicitly empty `filters` list
//! clears the filters.

use std::collections::HashMap;

use nostr_core::Filter;
use serde::Deserialize;
use serde_json::Value;

/// Hex public key of a subscriber.
pub type Identity = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadField {
    Filters,
    Tokens,
}

/// A single `filters`/`tokens` entry that could not be parsed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWarning {
    pub field: PayloadField,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlPayloadError {
    #[error("control payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control payload is not a JSON object")]
    NotAnObject,
    #[error("`{0}` in control payload is not an array")]
    NotAnArray(&'static str),
}

/// Decrypted control message content.
///
/// `None` means the field was absent (or null); `Some(vec![])` means it was
/// present and empty, which is a meaningful distinction for both sets.
#[derive(Debug, Default)]
pub struct ControlPayload {
    pub filters: Option<Vec<Filter>>,
    pub tokens: Option<Vec<String>>,
    pub warnings: Vec<EntryWarning>,
}

#[derive(Deserialize)]
struct FilterEntry {
    filter: Filter,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Object {
        #[serde(alias = "expoPushToken")]
        token: String,
    },
    Bare(String),
}

impl TokenEntry {
    fn into_token(self) -> String {
        match self {
            TokenEntry::Object { token } | TokenEntry::Bare(token) => token,
        }
    }
}

impl ControlPayload {
    pub fn parse(raw: &str) -> Result<Self, ControlPayloadError> {
        let value: Value = serde_json::from_str(raw)?;
        let object = value.as_object().ok_or(ControlPayloadError::NotAnObject)?;

        let mut warnings = Vec::new();
        let filters = parse_entries(
            object.get("filters"),
            PayloadField::Filters,
            &mut warnings,
            |v| serde_json::from_value::<FilterEntry>(v).map(|entry| entry.filter),
        )?;
        let tokens = parse_entries(
            object.get("tokens"),
            PayloadField::Tokens,
            &mut warnings,
            |v| serde_json::from_value::<TokenEntry>(v).map(TokenEntry::into_token),
        )?;

        Ok(Self {
            filters,
            tokens,
            warnings,
        })
    }
}

fn parse_entries<T>(
    field_value: Option<&Value>,
    field: PayloadField,
    warnings: &mut Vec<EntryWarning>,
    parse: impl Fn(Value) -> Result<T, serde_json::Error>,
) -> Result<Option<Vec<T>>, ControlPayloadError> {
    let entries = match field_value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(ControlPayloadError::NotAnArray(match field {
                PayloadField::Filters => "filters",
                PayloadField::Tokens => "tokens",
            }))
        }
    };

    let mut parsed = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match parse(entry.clone()) {
            Ok(item) => parsed.push(item),
            Err(e) => warnings.push(EntryWarning {
                field,
                index,
                reason: e.to_string(),
            }),
        }
    }
    Ok(Some(parsed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Created,
    Updated,
}

/// What happened to one of the two sets; the number is the resulting size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetUpdate {
    Replaced(usize),
    /// Tokens only: an empty list arrived and the previous tokens were kept.
    RetainedOnEmpty(usize),
    /// Field absent from the payload.
    Unchanged(usize),
}

impl SetUpdate {
    pub fn count(&self) -> usize {
        match *self {
            SetUpdate::Replaced(n) | SetUpdate::RetainedOnEmpty(n) | SetUpdate::Unchanged(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub identity: Identity,
    pub transition: Transition,
    pub filters: SetUpdate,
    pub tokens: SetUpdate,
    pub warnings: Vec<EntryWarning>,
}

/// Flattened view used for matching. Not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterIdentityPair<'a> {
    pub filter: &'a Filter,
    pub identity: &'a str,
}

#[derive(Debug, Default)]
struct Subscription {
    filters: Vec<Filter>,
    /// `None` until a non-empty token list has been received.
    tokens: Option<Vec<String>>,
}

/// Authoritative identity → {filters, tokens} mapping.
///
/// Owned by a single task; all mutation goes through `&mut self`, so a reader
/// flattening the registry never sees a half-applied update.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    order: Vec<Identity>,
    subscriptions: HashMap<Identity, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and apply a decrypted control message from `identity`.
    ///
    /// On a whole-message parse failure nothing changes for that identity.
    pub fn apply_control_message(
        &mut self,
        identity: &str,
        raw_content: &str,
    ) -> Result<ApplyReport, ControlPayloadError> {
        let payload = ControlPayload::parse(raw_content)?;
        Ok(self.apply_payload(identity, payload))
    }

    pub fn apply_payload(&mut self, identity: &str, payload: ControlPayload) -> ApplyReport {
        let transition = if self.subscriptions.contains_key(identity) {
            Transition::Updated
        } else {
            self.order.push(identity.to_string());
            Transition::Created
        };
        let subscription = self.subscriptions.entry(identity.to_string()).or_default();

        let filters = match payload.filters {
            Some(filters) => {
                subscription.filters = filters;
                SetUpdate::Replaced(subscription.filters.len())
            }
            None => SetUpdate::Unchanged(subscription.filters.len()),
        };

        let current_tokens = subscription.tokens.as_ref().map_or(0, Vec::len);
        let tokens = match payload.tokens {
            Some(tokens) if !tokens.is_empty() => {
                let n = tokens.len();
                subscription.tokens = Some(tokens);
                SetUpdate::Replaced(n)
            }
            Some(_) => SetUpdate::RetainedOnEmpty(current_tokens),
            None => SetUpdate::Unchanged(current_tokens),
        };

        ApplyReport {
            identity: identity.to_string(),
            transition,
            filters,
            tokens,
            warnings: payload.warnings,
        }
    }

    /// Every (filter, identity) pair, identities in registration order and
    /// filters in the order they were sent.
    pub fn pairs(&self) -> impl Iterator<Item = FilterIdentityPair<'_>> + '_ {
        self.order.iter().flat_map(move |identity| {
            self.subscriptions
                .get(identity)
                .map(|s| s.filters.as_slice())
                .unwrap_or_default()
                .iter()
                .map(move |filter| FilterIdentityPair { filter, identity })
        })
    }

    pub fn all_filter_identity_pairs(&self) -> Vec<FilterIdentityPair<'_>> {
        self.pairs().collect()
    }

    pub fn filters_for(&self, identity: &str) -> Option<&[Filter]> {
        self.subscriptions.get(identity).map(|s| s.filters.as_slice())
    }

    /// Tokens for `identity`; `None` if it never registered a non-empty list.
    pub fn tokens_for(&self, identity: &str) -> Option<&[String]> {
        self.subscriptions
            .get(identity)
            .and_then(|s| s.tokens.as_deref())
    }

    pub fn identity_count(&self) -> usize {
        self.order.len()
    }

    pub fn filter_count(&self) -> usize {
        self.subscriptions.values().map(|s| s.filters.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
