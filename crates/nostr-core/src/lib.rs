//! Nostr building blocks for nostr-push.
//!
//! This crate holds the pieces of the protocol the push service needs
//! without doing any I/O: the wire event model, NIP-01 filter matching and
//! the gate that recognises and decrypts NIP-04 control messages.

pub mod event;
pub mod filter;
pub mod gate;

// Re-export commonly used types
pub use event::{DataEvent, KIND_APP_DATA};
pub use filter::Filter;
pub use gate::{addressing, Addressing, ControlGate, DecryptionError, NIP04_IV_MARKER};

// Re-export nostr-sdk for convenience
pub use nostr_sdk;
