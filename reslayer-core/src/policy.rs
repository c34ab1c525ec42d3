//! Per-collection access policy.
//!
//! A collection is reachable only if the table has an entry for it with `reachable` set.
//! The table is an immutable snapshot; [`PolicyStore`] hands snapshots to requests and
//! swaps in a new table on reload.

use std::{collections::HashMap, sync::Arc};

use mea::rwlock::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

/// Static configuration of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionPolicy {
    /// Whether the collection may be touched at all.
    pub reachable: bool,
    /// Whether mutations publish change events.
    pub events: bool,
    /// Fields returned when the caller asks for none, and the cap on what callers may ask for.
    #[serde(deserialize_with = "dedup_keys")]
    pub default_keys: Option<Vec<String>>,
}

impl CollectionPolicy {
    pub fn reachable() -> Self {
        CollectionPolicy {
            reachable: true,
            ..CollectionPolicy::default()
        }
    }

    pub fn with_events(mut self) -> Self {
        self.events = true;
        self
    }

    /// Sets the allow-list, dropping repeated keys but keeping first-seen order.
    pub fn with_default_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_keys = Some(dedup(keys.into_iter().map(Into::into)));
        self
    }
}

fn dedup(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for key in keys {
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen
}

fn dedup_keys<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.map(|keys| dedup(keys.into_iter())))
}

/// Collection name to [`CollectionPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    collections: HashMap<String, CollectionPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        PolicyTable::default()
    }

    pub fn with(mut self, name: impl Into<String>, policy: CollectionPolicy) -> Self {
        self.collections.insert(name.into(), policy);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CollectionPolicy> {
        self.collections.get(name)
    }

    /// True when the collection has no entry or is not reachable.
    pub fn is_forbidden(&self, name: &str) -> bool {
        self.get(name).is_none_or(|policy| !policy.reachable)
    }

    pub fn events_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|policy| policy.events)
    }

    /// Resolves the fields to return for a read.
    ///
    /// - allow-list and request: the requested keys the allow-list permits, in request order
    /// - allow-list only: the allow-list
    /// - no allow-list: the request as given
    pub fn projection(&self, name: &str, requested: Option<&[String]>) -> Option<Vec<String>> {
        let allowed = self.get(name).and_then(|policy| policy.default_keys.as_ref());

        match (allowed, requested) {
            (Some(allowed), Some(requested)) if !requested.is_empty() => Some(
                requested
                    .iter()
                    .filter(|key| allowed.contains(key))
                    .cloned()
                    .collect(),
            ),
            (Some(allowed), _) => Some(allowed.clone()),
            (None, Some(requested)) if !requested.is_empty() => Some(requested.to_vec()),
            (None, _) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl FromIterator<(String, CollectionPolicy)> for PolicyTable {
    fn from_iter<T: IntoIterator<Item = (String, CollectionPolicy)>>(iter: T) -> Self {
        PolicyTable {
            collections: iter.into_iter().collect(),
        }
    }
}

/// Shared handle to the current [`PolicyTable`] snapshot.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    current: Arc<RwLock<Arc<PolicyTable>>>,
}

impl PolicyStore {
    pub fn new(table: PolicyTable) -> Self {
        PolicyStore {
            current: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    /// The table in force right now. Later reloads do not affect the returned snapshot.
    pub async fn snapshot(&self) -> Arc<PolicyTable> {
        self.current.read().await.clone()
    }

    /// Swaps in a new table for subsequent requests.
    pub async fn replace(&self, table: PolicyTable) {
        let collections = table.len();
        *self.current.write().await = Arc::new(table);
        tracing::info!(collections, "policy table reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|key| key.to_string()).collect()
    }

    fn table() -> PolicyTable {
        PolicyTable::new()
            .with(
                "users",
                CollectionPolicy::reachable().with_default_keys(["name", "email", "name", "role"]),
            )
            .with("notes", CollectionPolicy::reachable().with_events())
            .with("secrets", CollectionPolicy::default())
    }

    #[test]
    fn test_forbidden_collections() {
        let table = table();

        assert!(!table.is_forbidden("users"));
        assert!(table.is_forbidden("secrets"));
        assert!(table.is_forbidden("unknown"));
    }

    #[test]
    fn test_events_flag() {
        let table = table();

        assert!(table.events_enabled("notes"));
        assert!(!table.events_enabled("users"));
        assert!(!table.events_enabled("unknown"));
    }

    #[test]
    fn test_default_keys_are_deduplicated() {
        assert_eq!(
            table().get("users").unwrap().default_keys,
            Some(keys(&["name", "email", "role"]))
        );
    }

    #[test]
    fn test_projection_intersects_in_request_order() {
        let table = table();

        assert_eq!(
            table.projection("users", Some(&keys(&["role", "password", "name"]))),
            Some(keys(&["role", "name"]))
        );
        assert_eq!(
            table.projection("users", None),
            Some(keys(&["name", "email", "role"]))
        );
        assert_eq!(
            table.projection("notes", Some(&keys(&["title"]))),
            Some(keys(&["title"]))
        );
        assert_eq!(table.projection("notes", None), None);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: CollectionPolicy = serde_json::from_str(
            r#"{ "reachable": true, "default_keys": ["a", "b", "a"] }"#,
        )
        .unwrap();

        assert_eq!(
            policy,
            CollectionPolicy {
                reachable: true,
                events: false,
                default_keys: Some(keys(&["a", "b"])),
            }
        );
    }

    #[tokio::test]
    async fn test_store_replace_swaps_snapshot() {
        let store = PolicyStore::new(table());
        let before = store.snapshot().await;

        store.replace(PolicyTable::new()).await;

        assert!(!before.is_forbidden("users"));
        assert!(store.snapshot().await.is_forbidden("users"));
    }
}
