//! Event model as it travels through the queue.
//!
//! Events are kept in their loose NIP-01 JSON shape (hex strings, raw string
//! tags). Signatures were verified by the relay before fan-out and are not
//! checked again here.

use serde::{Deserialize, Serialize};

/// Kind of the encrypted control message carrying a subscriber's filters and push tokens.
pub const KIND_APP_DATA: u16 = 10395;

/// A network event, control message or ordinary note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl DataEvent {
    /// True for the reserved control-message kind.
    pub fn is_control(&self) -> bool {
        self.kind == KIND_APP_DATA
    }

    /// Values (second element) of every tag named `name`, in tag order.
    ///
    /// Tags with no value are skipped.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// First tag value whose tag name is any of `names`.
    pub fn first_tag_value(&self, names: &[&str]) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [tag_name, value, ..] if names.contains(&tag_name.as_str()) => Some(value.as_str()),
            _ => None,
        })
    }

    /// Shortened id for log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

impl From<&nostr_sdk::Event> for DataEvent {
    fn from(event: &nostr_sdk::Event) -> Self {
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_secs(),
            kind: event.kind.as_u16(),
            tags: event.tags.iter().map(|tag| tag.as_slice().to_vec()).collect(),
            content: event.content.clone(),
            sig: event.sig.to_string(),
        }
    }
}
