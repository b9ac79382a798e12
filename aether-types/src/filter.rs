//! Subscription filters.
//!
//! A filter is a conjunction of optional predicates; within a predicate
//! the listed alternatives are a disjunction. Tag requirements AND across
//! keys and OR within a key. `limit` is not a match predicate — it only
//! bounds historical backfill.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::FilterError;
use crate::event::Event;

/// A normalized subscription filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Allowed kinds, any-of.
    pub kinds: Option<BTreeSet<u16>>,
    /// Pubkey byte prefixes, any-of. Each at most 32 bytes.
    pub pubkey_prefixes: Option<Vec<Vec<u8>>>,
    /// Required tags: for every key, the event must carry at least one of
    /// the listed values.
    pub tags: Option<BTreeMap<String, BTreeSet<String>>>,
    /// Closed lower bound on `created_at`.
    pub since: Option<u64>,
    /// Closed upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of historical events returned during backfill.
    pub limit: Option<usize>,
}

impl Filter {
    /// Normalize a raw JSON filter object.
    ///
    /// Integer fields are coerced from strings, and tag requirements are
    /// accepted either as `[[key, value], ...]` pairs or as a
    /// `{key: [values]}` map; both shapes normalize identically.
    pub fn from_value(raw: &Value) -> Result<Self, FilterError> {
        let kinds = match raw.get("kinds") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let mut kinds = BTreeSet::new();
                for item in items {
                    kinds.insert(parse_uint(item, "kinds")? as u16);
                }
                Some(kinds)
            }
            Some(_) => return Err(FilterError::BadList("kinds")),
        };

        let pubkey_prefixes = match raw.get("pubkey_prefixes") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                let mut prefixes = Vec::with_capacity(items.len());
                for item in items {
                    let text = item.as_str().ok_or(FilterError::BadPrefix)?;
                    let bytes = hex::decode(text).map_err(|_| FilterError::BadPrefix)?;
                    if bytes.len() > 32 {
                        return Err(FilterError::BadPrefix);
                    }
                    prefixes.push(bytes);
                }
                Some(prefixes)
            }
            Some(_) => return Err(FilterError::BadList("pubkey_prefixes")),
        };

        let tags = match raw.get("tags") {
            None | Some(Value::Null) => None,
            Some(value) => Some(normalize_tag_filters(value)?),
        };

        let since = parse_opt_uint(raw.get("since"), "since")?;
        let until = parse_opt_uint(raw.get("until"), "until")?;
        let limit = parse_opt_uint(raw.get("limit"), "limit")?.map(|v| v as usize);

        Ok(Self {
            kinds,
            pubkey_prefixes,
            tags,
            since,
            until,
            limit,
        })
    }

    /// Authoritative match: true iff every present predicate holds.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(prefixes) = &self.pubkey_prefixes {
            if !prefixes.iter().any(|p| event.pubkey.starts_with(p)) {
                return false;
            }
        }
        if let Some(required) = &self.tags {
            for (key, accepted) in required {
                let satisfied = event.tags.iter().any(|tag| {
                    tag.key == *key && tag.values.iter().any(|v| accepted.contains(v))
                });
                if !satisfied {
                    return false;
                }
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

fn normalize_tag_filters(raw: &Value) -> Result<BTreeMap<String, BTreeSet<String>>, FilterError> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    match raw {
        Value::Object(map) => {
            for (key, values) in map {
                let list = values.as_array().ok_or(FilterError::BadTagFilter)?;
                let entry = out.entry(key.clone()).or_default();
                for value in list {
                    entry.insert(stringify(value));
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                let pair = entry.as_array().ok_or(FilterError::BadTagFilter)?;
                if pair.len() != 2 {
                    return Err(FilterError::BadTagFilter);
                }
                let key = pair[0].as_str().ok_or(FilterError::BadTagFilter)?;
                out.entry(key.to_string())
                    .or_default()
                    .insert(stringify(&pair[1]));
            }
        }
        _ => return Err(FilterError::BadTagFilter),
    }
    Ok(out)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_uint(value: &Value, field: &'static str) -> Result<u64, FilterError> {
    match value {
        Value::Number(n) => n.as_u64().ok_or(FilterError::BadInt(field)),
        Value::String(s) => s.parse().map_err(|_| FilterError::BadInt(field)),
        _ => Err(FilterError::BadInt(field)),
    }
}

fn parse_opt_uint(value: Option<&Value>, field: &'static str) -> Result<Option<u64>, FilterError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_uint(v, field).map(Some),
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = [
            self.kinds.is_some(),
            self.pubkey_prefixes.is_some(),
            self.tags.is_some(),
            self.since.is_some(),
            self.until.is_some(),
            self.limit.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        let mut map = serializer.serialize_map(Some(fields))?;
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(prefixes) = &self.pubkey_prefixes {
            let hex: Vec<String> = prefixes.iter().map(hex::encode).collect();
            map.serialize_entry("pubkey_prefixes", &hex)?;
        }
        if let Some(tags) = &self.tags {
            map.serialize_entry("tags", tags)?;
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

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use serde_json::json;

    fn event(kind: u16, created_at: u64, tags: Vec<Tag>) -> Event {
        Event::signed(&[9u8; 32], kind, created_at, tags, "")
    }

    fn tag(key: &str, values: &[&str]) -> Tag {
        Tag::new(key, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = Filter::default();
        assert!(filter.matches(&event(1, 0, vec![])));
        assert!(filter.matches(&event(39_999, u64::MAX, vec![tag("d", &["x"])])));
    }

    #[test]
    fn kind_predicate() {
        let filter = Filter::from_value(&json!({"kinds": [1, 2]})).unwrap();
        assert!(filter.matches(&event(1, 0, vec![])));
        assert!(filter.matches(&event(2, 0, vec![])));
        assert!(!filter.matches(&event(3, 0, vec![])));
    }

    #[test]
    fn since_until_are_closed_bounds() {
        let filter = Filter::from_value(&json!({"since": 10, "until": 20})).unwrap();
        assert!(!filter.matches(&event(1, 9, vec![])));
        assert!(filter.matches(&event(1, 10, vec![])));
        assert!(filter.matches(&event(1, 20, vec![])));
        assert!(!filter.matches(&event(1, 21, vec![])));
    }

    #[test]
    fn pubkey_prefix_predicate() {
        let ev = event(1, 0, vec![]);
        let full = hex::encode(ev.pubkey.as_bytes());
        let filter = Filter::from_value(&json!({ "pubkey_prefixes": [&full[..8]] })).unwrap();
        assert!(filter.matches(&ev));
        let miss = Filter::from_value(&json!({"pubkey_prefixes": ["ffff"]})).unwrap();
        assert!(!miss.matches(&ev));
    }

    #[test]
    fn tags_or_within_key() {
        let filter = Filter::from_value(&json!({"tags": {"c": ["vision", "audio"]}})).unwrap();
        assert!(filter.matches(&event(1, 0, vec![tag("c", &["vision"])])));
        assert!(filter.matches(&event(1, 0, vec![tag("c", &["audio"])])));
        assert!(!filter.matches(&event(1, 0, vec![tag("c", &["touch"])])));
        assert!(!filter.matches(&event(1, 0, vec![])));
    }

    #[test]
    fn tags_and_across_keys() {
        let x = "ab".repeat(32);
        let filter =
            Filter::from_value(&json!({"tags": {"c": ["vision"], "p": [x.clone()]}})).unwrap();
        assert!(filter.matches(&event(
            1,
            0,
            vec![tag("c", &["vision"]), tag("p", &[x.as_str()])]
        )));
        assert!(!filter.matches(&event(1, 0, vec![tag("c", &["vision"])])));
        assert!(!filter.matches(&event(1, 0, vec![tag("p", &[x.as_str()])])));
    }

    #[test]
    fn tag_filters_accept_both_shapes() {
        let from_map = Filter::from_value(&json!({"tags": {"c": ["a", "b"]}})).unwrap();
        let from_pairs =
            Filter::from_value(&json!({"tags": [["c", "a"], ["c", "b"]]})).unwrap();
        assert_eq!(from_map, from_pairs);
    }

    #[test]
    fn integer_strings_are_coerced() {
        let filter =
            Filter::from_value(&json!({"kinds": ["1"], "since": "5", "limit": "3"})).unwrap();
        assert!(filter.kinds.unwrap().contains(&1));
        assert_eq!(filter.since, Some(5));
        assert_eq!(filter.limit, Some(3));
    }

    #[test]
    fn limit_is_not_a_match_predicate() {
        let filter = Filter::from_value(&json!({"limit": 0})).unwrap();
        assert!(filter.matches(&event(1, 0, vec![])));
    }

    #[test]
    fn removing_a_predicate_only_enlarges_the_match_set() {
        let narrow = Filter::from_value(&json!({"kinds": [1], "since": 10})).unwrap();
        let wide = Filter::from_value(&json!({"kinds": [1]})).unwrap();
        for ev in [
            event(1, 5, vec![]),
            event(1, 15, vec![]),
            event(2, 15, vec![]),
        ] {
            if narrow.matches(&ev) {
                assert!(wide.matches(&ev));
            }
        }
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let long = "ab".repeat(33);
        assert_eq!(
            Filter::from_value(&json!({"pubkey_prefixes": [long]})),
            Err(FilterError::BadPrefix)
        );
    }

    #[test]
    fn serde_roundtrip() {
        let filter = Filter::from_value(&json!({
            "kinds": [1, 2],
            "tags": {"c": ["vision"]},
            "since": 10,
            "limit": 50,
        }))
        .unwrap();
        let json = serde_json::to_string(&filter).unwrap();
        let restored: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, restored);
    }
}
