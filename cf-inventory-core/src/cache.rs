//! Read-through lookup caches keyed by resource GUID.
//!
//! A cache is bulk-loaded once per run from a paginated list endpoint and
//! falls back to a single-resource GET on a miss. Misses that fail are
//! remembered so a broken GUID costs one request, not one per worker.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{list_path, paginate};
use crate::contract::{ApiClient, ApiError};

#[derive(Debug)]
pub struct LookupCache {
    /// List endpoint, e.g. `/v3/spaces`; single resources live at `<collection>/<guid>`.
    collection: String,
    entries: RwLock<HashMap<String, Option<Value>>>,
}

impl LookupCache {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fill the cache from every page of the collection.
    pub async fn load_all<A>(&self, client: &A) -> Result<usize, ApiError>
    where
        A: ApiClient + ?Sized,
    {
        let resources = paginate(client, &list_path(&self.collection)).await?;
        let loaded = self.insert_all(resources);
        info!(collection = %self.collection, loaded, "Lookup cache loaded");
        Ok(loaded)
    }

    pub fn insert_all(&self, resources: impl IntoIterator<Item = Value>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let mut count = 0;
        for resource in resources {
            if let Some(guid) = resource.get("guid").and_then(Value::as_str) {
                entries.insert(guid.to_string(), Some(resource.clone()));
                count += 1;
            }
        }
        count
    }

    fn cached(&self, guid: &str) -> Option<Option<Value>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(guid).cloned()
    }

    /// Resource by GUID, fetching it on a miss.
    pub async fn get<A>(&self, client: &A, guid: &str) -> Option<Value>
    where
        A: ApiClient + ?Sized,
    {
        if guid.is_empty() {
            return None;
        }
        if let Some(hit) = self.cached(guid) {
            return hit;
        }
        let path = format!("{}/{guid}", self.collection);
        let fetched = match client.get_json(&path).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path, error = %e, "Lookup failed");
                None
            }
        };
        debug!(path = %path, found = fetched.is_some(), "Lookup cache miss");
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries
            .entry(guid.to_string())
            .or_insert(fetched)
            .clone()
    }

    /// A string field of the resource, or an empty string.
    pub async fn field<A>(&self, client: &A, guid: &str, key: &str) -> String
    where
        A: ApiClient + ?Sized,
    {
        self.get(client, guid)
            .await
            .and_then(|v| v.get(key).and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    }

    pub async fn name<A>(&self, client: &A, guid: &str) -> String
    where
        A: ApiClient + ?Sized,
    {
        self.field(client, guid, "name").await
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// GUID of a to-one relationship, e.g. `relationships.space.data.guid`.
pub fn relationship_guid<'a>(resource: &'a Value, relation: &str) -> Option<&'a str> {
    resource
        .get("relationships")?
        .get(relation)?
        .get("data")?
        .get("guid")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockApiClient;
    use serde_json::json;

    #[tokio::test]
    async fn misses_are_fetched_once() {
        let mut mock = MockApiClient::new();
        mock.expect_get_json()
            .withf(|p| p == "/v3/stacks/s2")
            .times(1)
            .returning(|_| Ok(Some(json!({"guid": "s2", "name": "cflinuxfs4"}))));
        let cache = LookupCache::new("/v3/stacks");
        cache.insert_all(vec![json!({"guid": "s1", "name": "cflinuxfs3"})]);

        assert_eq!(cache.name(&mock, "s1").await, "cflinuxfs3");
        assert_eq!(cache.name(&mock, "s2").await, "cflinuxfs4");
        assert_eq!(cache.name(&mock, "s2").await, "cflinuxfs4");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_lookups_are_remembered() {
        let mut mock = MockApiClient::new();
        mock.expect_get_json().times(1).returning(|p| {
            Err(ApiError::Status {
                url: p.to_string(),
                status: 404,
                body: String::new(),
            })
        });
        let cache = LookupCache::new("/v3/spaces");
        assert_eq!(cache.get(&mock, "gone").await, None);
        assert_eq!(cache.get(&mock, "gone").await, None);
    }

    #[test]
    fn relationship_guid_reads_nested_data() {
        let app = json!({"relationships": {"space": {"data": {"guid": "sp-1"}}}});
        assert_eq!(relationship_guid(&app, "space"), Some("sp-1"));
        assert_eq!(relationship_guid(&app, "organization"), None);
    }
}
