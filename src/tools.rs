//! Operator utilities: key handling and publishing test control messages.

use anyhow::{Context, Result};
use clap::Subcommand;
use nostr_core::KIND_APP_DATA;
use nostr_sdk::nips::nip04;
use nostr_sdk::prelude::*;
use serde_json::{json, Value};

#[derive(Subcommand, Debug)]
pub enum KeysCommands {
    /// Generate a new key pair
    Generate,
    /// Print the public key for a secret key
    Derive {
        /// Secret key (hex or nsec1...)
        #[clap(long)]
        private_key: String,
    },
    /// Encrypt and decrypt a sample message between two fresh key pairs
    Roundtrip,
}

#[derive(clap::Args, Debug)]
pub struct SendArgs {
    /// Sender secret key (hex or nsec1...); the sender becomes the subscriber identity
    #[clap(long)]
    pub private_key: String,
    /// Service public key (hex or npub1...)
    #[clap(long)]
    pub recipient: String,
    /// Relay to publish to
    #[clap(long, default_value = "ws://localhost:7777")]
    pub relay: String,
    /// Literal control payload JSON, sent as-is
    #[clap(long, conflicts_with_all = ["filter", "token"])]
    pub message: Option<String>,
    /// Filter JSON, repeatable
    #[clap(long)]
    pub filter: Vec<String>,
    /// Push token, repeatable
    #[clap(long)]
    pub token: Vec<String>,
}

pub fn handle_keys(cmd: KeysCommands) -> Result<()> {
    match cmd {
        KeysCommands::Generate => cmd_generate(),
        KeysCommands::Derive { private_key } => cmd_derive(&private_key),
        KeysCommands::Roundtrip => cmd_roundtrip(),
    }
}

fn cmd_generate() -> Result<()> {
    let keys = Keys::generate();
    println!("🔑 New key pair:\n");
    println!("  secret (hex): {}", keys.secret_key().to_secret_hex());
    println!("  nsec:         {}", keys.secret_key().to_bech32()?);
    println!("  public (hex): {}", keys.public_key().to_hex());
    println!("  npub:         {}", keys.public_key().to_bech32()?);
    Ok(())
}

fn cmd_derive(private_key: &str) -> Result<()> {
    let keys = Keys::parse(private_key).map_err(|e| anyhow::anyhow!("Invalid secret key: {e}"))?;
    println!("  public (hex): {}", keys.public_key().to_hex());
    println!("  npub:         {}", keys.public_key().to_bech32()?);
    Ok(())
}

fn cmd_roundtrip() -> Result<()> {
    let sender = Keys::generate();
    let receiver = Keys::generate();
    let plaintext = r#"{"filters":[],"tokens":[]}"#;

    let ciphertext = nip04::encrypt(sender.secret_key(), &receiver.public_key(), plaintext)
        .context("Encryption failed")?;
    let decrypted = nip04::decrypt(receiver.secret_key(), &sender.public_key(), &ciphertext)
        .context("Decryption failed")?;

    println!("  ciphertext: {ciphertext}");
    if decrypted != plaintext {
        anyhow::bail!("Round trip mismatch: got {decrypted:?}");
    }
    println!("✅ NIP-04 round trip ok");
    Ok(())
}

/// Assemble a control payload from filter JSON strings and tokens.
pub fn build_control_payload(filters: &[String], tokens: &[String]) -> Result<String> {
    let filters = filters
        .iter()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .with_context(|| format!("Invalid filter JSON: {raw}"))
                .map(|filter| json!({ "filter": filter }))
        })
        .collect::<Result<Vec<_>>>()?;
    let tokens: Vec<Value> = tokens.iter().map(|t| json!({ "token": t })).collect();

    let mut payload = serde_json::Map::new();
    if !filters.is_empty() {
        payload.insert("filters".into(), Value::Array(filters));
    }
    if !tokens.is_empty() {
        payload.insert("tokens".into(), Value::Array(tokens));
    }
    Ok(Value::Object(payload).to_string())
}

/// Encrypt `plaintext` to `recipient` and sign it as a control event.
pub fn seal_control_event(keys: &Keys, recipient: &PublicKey, plaintext: &str) -> Result<Event> {
    let content =
        nip04::encrypt(keys.secret_key(), recipient, plaintext).context("Encryption failed")?;
    let event = EventBuilder::new(Kind::Custom(KIND_APP_DATA), content)
        .tags(vec![Tag::public_key(*recipient)])
        .sign_with_keys(keys)?;
    Ok(event)
}

pub async fn handle_send(args: SendArgs) -> Result<()> {
    let keys =
        Keys::parse(&args.private_key).map_err(|e| anyhow::anyhow!("Invalid secret key: {e}"))?;
    let recipient =
        PublicKey::parse(&args.recipient).map_err(|e| anyhow::anyhow!("Invalid recipient: {e}"))?;

    let plaintext = match &args.message {
        Some(message) => message.clone(),
        None => build_control_payload(&args.filter, &args.token)?,
    };
    let event = seal_control_event(&keys, &recipient, &plaintext)?;

    let client = Client::new(keys.clone());
    client
        .add_relay(args.relay.as_str())
        .await
        .with_context(|| format!("Failed to add relay: {}", args.relay))?;
    client.connect().await;

    let output = client
        .send_event(&event)
        .await
        .context("Failed to publish control message")?;

    println!("✅ Control message published");
    println!("   from:    {}", keys.public_key().to_hex());
    println!("   to:      {}", recipient.to_hex());
    println!("   payload: {plaintext}");
    println!("   event:   {}", output.val);

    client.disconnect().await;
    Ok(())
}
