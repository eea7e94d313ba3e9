//! One-shot read of past control events from the relay.

use std::time::Duration;

use anyhow::{Context, Result};
use nostr_core::{DataEvent, KIND_APP_DATA};
use nostr_sdk::{Client, Filter, Kind};
use tracing::{debug, info};

/// Fetch every stored control event. Completes at end-of-stored-events or
/// after `timeout`, whichever comes first.
pub async fn load_history(relay_url: &str, timeout: Duration) -> Result<Vec<DataEvent>> {
    let client = Client::default();
    client
        .add_relay(relay_url)
        .await
        .with_context(|| format!("Failed to add relay: {relay_url}"))?;
    client.connect().await;
    info!("Reading subscription history from {relay_url}");

    let filter = Filter::new().kind(Kind::Custom(KIND_APP_DATA));
    // The outer timeout also covers a relay that never finishes connecting.
    let fetched = tokio::time::timeout(
        timeout + Duration::from_secs(1),
        client.fetch_events(filter, timeout),
    )
    .await;
    client.disconnect().await;

    let events = fetched
        .map_err(|_| anyhow::anyhow!("Timed out reading history from {relay_url}"))?
        .context("Failed to fetch control events")?;

    let mut events: Vec<DataEvent> = events.iter().map(DataEvent::from).collect();
    // Oldest first, so the newest message per subscriber is applied last.
    events.sort_by_key(|e| e.created_at);
    debug!("Fetched {} control events", events.len());
    Ok(events)
}

/// Connectivity check for `check`: connect and ask for a single event.
pub async fn check_relay(relay_url: &str, timeout: Duration) -> Result<usize> {
    let client = Client::default();
    client
        .add_relay(relay_url)
        .await
        .with_context(|| format!("Failed to add relay: {relay_url}"))?;
    client.connect().await;

    let filter = Filter::new().kind(Kind::Custom(KIND_APP_DATA)).limit(1);
    let result = tokio::time::timeout(timeout, client.fetch_events(filter, timeout)).await;
    client.disconnect().await;

    let events = result
        .map_err(|_| anyhow::anyhow!("Relay did not answer within {timeout:?}"))?
        .context("Relay query failed")?;
    Ok(events.len())
}
