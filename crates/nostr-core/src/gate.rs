//! Recognition and decryption of control messages addressed to this service.

use nostr_sdk::nips::nip04;
use nostr_sdk::{Keys, PublicKey};

use crate::event::DataEvent;

/// NIP-04 ciphertexts embed their IV as `<base64>?iv=<base64>`.
pub const NIP04_IV_MARKER: &str = "?iv=";

/// Outcome of the addressing check for an inbound control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    ForMe,
    /// No `p` tag with a value.
    NoRecipient,
    /// The first `p` tag names someone else. Later `p` tags are not considered.
    OtherRecipient(String),
    /// Content lacks the NIP-04 IV marker.
    NotEncrypted,
}

impl Addressing {
    pub fn is_for_me(&self) -> bool {
        matches!(self, Addressing::ForMe)
    }
}

/// Check whether `event` is an encrypted message whose first recipient is `my_identity`.
pub fn addressing(event: &DataEvent, my_identity: &str) -> Addressing {
    let Some(first) = event.tag_values("p").next() else {
        return Addressing::NoRecipient;
    };
    if first != my_identity {
        return Addressing::OtherRecipient(first.to_string());
    }
    if !event.content.contains(NIP04_IV_MARKER) {
        return Addressing::NotEncrypted;
    }
    Addressing::ForMe
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("invalid sender public key {pubkey}: {source}")]
    InvalidSender {
        pubkey: String,
        #[source]
        source: nostr_sdk::key::Error,
    },
    #[error("NIP-04 decryption failed: {0}")]
    Cipher(#[from] nip04::Error),
}

/// Holds the service key pair and opens control messages sent to it.
#[derive(Clone)]
pub struct ControlGate {
    keys: Keys,
    identity: String,
}

impl ControlGate {
    pub fn new(keys: Keys) -> Self {
        let identity = keys.public_key().to_hex();
        Self { keys, identity }
    }

    /// Hex public key the service is reachable under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn addressing(&self, event: &DataEvent) -> Addressing {
        addressing(event, &self.identity)
    }

    pub fn is_addressed_to_me(&self, event: &DataEvent) -> bool {
        self.addressing(event).is_for_me()
    }

    /// Decrypt a NIP-04 ciphertext sent by the hex public key `sender`.
    pub fn decrypt(&self, ciphertext: &str, sender: &str) -> Result<String, DecryptionError> {
        let sender_key = PublicKey::from_hex(sender).map_err(|source| {
            DecryptionError::InvalidSender {
                pubkey: sender.to_string(),
                source,
            }
        })?;
        Ok(nip04::decrypt(self.keys.secret_key(), &sender_key, ciphertext)?)
    }
}
