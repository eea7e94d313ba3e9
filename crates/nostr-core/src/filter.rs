//! NIP-01 event filters and the live matching predicate.
//!
//! A filter is a conjunction of optional constraints. Within one constraint
//! any listed value is accepted; tag constraints are AND'ed across tag names
//! and OR'ed within one name's values. `limit` only shapes historical queries and
//! is carried through untouched.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::event::DataEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    pub authors: Option<BTreeSet<String>>,
    /// Required tag values keyed by tag name, from the `#<name>` keys.
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).insert(author.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.entry(name.into()).or_default().insert(value.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every constraint of this filter.
    ///
    /// An absent or empty `ids`/`kinds`/`authors` set accepts anything. A tag
    /// name with an empty value set can never be satisfied.
    pub fn matches(&self, event: &DataEvent) -> bool {
        allows(&self.ids, &event.id)
            && allows(&self.kinds, &event.kind)
            && allows(&self.authors, &event.pubkey)
            && self.matches_tags(event)
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
    }

    fn matches_tags(&self, event: &DataEvent) -> bool {
        self.tags
            .iter()
            .all(|(name, wanted)| event.tag_values(name).any(|value| wanted.contains(value)))
    }
}

fn allows<T: Ord>(set: &Option<BTreeSet<T>>, value: &T) -> bool {
    match set {
        Some(values) if !values.is_empty() => values.contains(value),
        _ => true,
    }
}


#[derive(Deserialize)]
struct RawFilter {
    #[serde(default)]
    ids: Option<BTreeSet<String>>,
    #[serde(default)]
    kinds: Option<BTreeSet<u16>>,
    #[serde(default)]
    authors: Option<BTreeSet<String>>,
    #[serde(default)]
    since: Option<u64>,
    #[serde(default)]
    until: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawFilter::deserialize(deserializer)?;

        let mut tags = BTreeMap::new();
        for (key, value) in raw.rest {
            // Anything else (e.g. NIP-50 `search`) has no meaning for live matching.
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            if name.is_empty() {
                return Err(de::Error::custom("tag constraint `#` has no tag name"));
            }
            let values: BTreeSet<String> = serde_json::from_value(value)
                .map_err(|e| de::Error::custom(format!("invalid values for {key}: {e}")))?;
            tags.insert(name.to_string(), values);
        }

        Ok(Filter {
            ids: raw.ids,
            kinds: raw.kinds,
            authors: raw.authors,
            tags,
            since: raw.since,
            until: raw.until,
            limit: raw.limit,
        })
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}
