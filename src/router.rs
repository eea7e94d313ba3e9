//! Fan-out of a data event to the identities whose filters match it.

use std::collections::HashSet;

use nostr_core::DataEvent;

use crate::registry::SubscriptionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing<'a> {
    /// Matching identities, each once, in first-match order.
    pub identities: Vec<&'a str>,
    /// Number of (filter, identity) pairs that matched, before deduplication.
    pub matched_filters: usize,
}

/// Evaluate every registered filter against `event`.
///
/// Identities without push tokens are still returned; the caller decides
/// what to do with them.
pub fn route<'a>(event: &DataEvent, registry: &'a SubscriptionRegistry) -> Routing<'a> {
    let mut seen = HashSet::new();
    let mut identities = Vec::new();
    let mut matched_filters = 0;

    for pair in registry.pairs() {
        if !pair.filter.matches(event) {
            continue;
        }
        matched_filters += 1;
        if seen.insert(pair.identity) {
            identities.push(pair.identity);
        }
    }

    Routing {
        identities,
        matched_filters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, author: &str) -> DataEvent {
        DataEvent {
            id: "ev".into(),
            pubkey: author.into(),
            created_at: 100,
            kind,
            tags: vec![],
            content: "hi".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn dedupes_identity_with_several_matching_filters() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .apply_control_message(
                "X",
                r#"{"filters":[{"filter":{"kinds":[1]}},{"filter":{"authors":["A"]}},{"filter":{"kinds":[2]}}]}"#,
            )
            .unwrap();

        let routing = route(&event(1, "A"), &registry);
        assert_eq!(routing.identities, vec!["X"]);
        assert_eq!(routing.matched_filters, 2);
    }

    #[test]
    fn only_matching_identities_are_returned() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .apply_control_message("X", r#"{"filters":[{"filter":{"kinds":[7]}}]}"#)
            .unwrap();
        registry
            .apply_control_message("Y", r#"{"filters":[{"filter":{"kinds":[1]}}]}"#)
            .unwrap();
        registry
            .apply_control_message("Z", r#"{"filters":[{"filter":{}}]}"#)
            .unwrap();

        let routing = route(&event(1, "anyone"), &registry);
        assert_eq!(routing.identities, vec!["Y", "Z"]);
    }

    #[test]
    fn empty_registry_routes_nowhere() {
        let registry = SubscriptionRegistry::new();
        let routing = route(&event(1, "A"), &registry);
        assert!(routing.identities.is_empty());
        assert_eq!(routing.matched_filters, 0);
    }

    #[test]
    fn identities_without_tokens_are_still_routed() {
        let mut registry = SubscriptionRegistry::new();
        registry
            .apply_control_message("X", r#"{"filters":[{"filter":{"kinds":[1]}}]}"#)
            .unwrap();
        let routing = route(&event(1, "A"), &registry);
        assert_eq!(routing.identities, vec!["X"]);
        assert!(registry.tokens_for("X").is_none());
    }
}
