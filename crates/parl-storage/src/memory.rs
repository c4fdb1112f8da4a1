use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use parl_core::{EntityType, Query, Record, RemoteRecord};
use serde_json::{json, Value as JsonValue};

use crate::remote::{RemoteStore, StoreError};

/// In-process document store with the same query semantics as the HTTP API.
///
/// Backs `--dry-run` exports and the engine tests. Counts every call by
/// operation name so callers can check how many round trips a run made.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<EntityType, Vec<Record>>,
    next_id: u64,
    calls: BTreeMap<&'static str, usize>,
    rejecting: BTreeSet<EntityType>,
}

impl MemoryState {
    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn mint_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:024x}", self.next_id)
    }

    fn insert(&mut self, entity: EntityType, mut record: Record) -> String {
        let id = self.mint_id();
        record.insert("id".to_string(), json!(id));
        self.collections.entry(entity).or_default().push(record);
        id
    }

    fn lookup(&self, entity: EntityType, query: &Query) -> Vec<Record> {
        let mut found = self
            .collections
            .get(&entity)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| query.matches(record))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| query.compare(a, b));
        found
            .into_iter()
            .map(|record| self.with_embedded(entity, record, &query.embed))
            .collect()
    }

    fn with_embedded(&self, entity: EntityType, mut record: Record, embed: &[String]) -> Record {
        let Some(id) = record.get("id").cloned() else {
            return record;
        };
        for name in embed {
            let Some((child, foreign_key)) = embedded_relation(entity, name) else {
                continue;
            };
            let children = self
                .collections
                .get(&child)
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r.get(foreign_key) == Some(&id))
                        .cloned()
                        .map(JsonValue::Object)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            record.insert(name.clone(), JsonValue::Array(children));
        }
        record
    }
}

fn embedded_relation(entity: EntityType, name: &str) -> Option<(EntityType, &'static str)> {
    match (entity, name) {
        (EntityType::VoteEvents, "votes") => Some((EntityType::Votes, "vote_event_id")),
        (EntityType::Motions, "vote_events") => Some((EntityType::VoteEvents, "motion_id")),
        (EntityType::People, "memberships") => Some((EntityType::Memberships, "person_id")),
        (EntityType::Organizations, "memberships") => {
            Some((EntityType::Memberships, "organization_id"))
        }
        _ => None,
    }
}

fn self_link(entity: EntityType, id: &str) -> JsonValue {
    json!({ "self": { "href": format!("{}/{}", entity.endpoint(), id), "title": entity.endpoint() } })
}

fn write_ok(entity: EntityType, id: &str) -> RemoteRecord {
    let mut fields = Record::new();
    fields.insert("_status".into(), json!(RemoteRecord::STATUS_OK));
    fields.insert("id".into(), json!(id));
    fields.insert("_links".into(), self_link(entity, id));
    RemoteRecord::new(fields)
}

fn write_err(code: u16, message: &str) -> RemoteRecord {
    let mut fields = Record::new();
    fields.insert("_status".into(), json!("ERR"));
    fields.insert("_error".into(), json!({ "code": code, "message": message }));
    RemoteRecord::new(fields)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves the maps consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `record` directly, bypassing call accounting. Returns its id.
    pub fn seed(&self, entity: EntityType, record: Record) -> String {
        self.state().insert(entity, record)
    }

    /// Makes every later write to `entity` answer with an `ERR` status.
    pub fn reject_writes(&self, entity: EntityType) {
        self.state().rejecting.insert(entity);
    }

    pub fn records(&self, entity: EntityType) -> Vec<Record> {
        self.state()
            .collections
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, entity: EntityType) -> usize {
        self.state().collections.get(&entity).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.state().collections.values().all(Vec::is_empty)
    }

    /// Number of calls made to operation `op` (`find_first`, `find_many`,
    /// `create`, `update`, `bulk_create`, `get`).
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn find_first(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Option<RemoteRecord>, StoreError> {
        let mut state = self.state();
        state.count("find_first");
        Ok(state
            .lookup(entity, query)
            .into_iter()
            .next()
            .map(RemoteRecord::new))
    }

    async fn find_many(
        &self,
        entity: EntityType,
        query: &Query,
    ) -> Result<Vec<RemoteRecord>, StoreError> {
        let mut state = self.state();
        state.count("find_many");
        Ok(state
            .lookup(entity, query)
            .into_iter()
            .map(RemoteRecord::new)
            .collect())
    }

    async fn create(
        &self,
        entity: EntityType,
        record: &Record,
    ) -> Result<RemoteRecord, StoreError> {
        let mut state = self.state();
        state.count("create");
        if state.rejecting.contains(&entity) {
            return Ok(write_err(422, "rejected"));
        }
        let id = state.insert(entity, record.clone());
        Ok(write_ok(entity, &id))
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        record: &Record,
    ) -> Result<RemoteRecord, StoreError> {
        let mut state = self.state();
        state.count("update");
        if state.rejecting.contains(&entity) {
            return Ok(write_err(422, "rejected"));
        }
        let existing = state
            .collections
            .get_mut(&entity)
            .and_then(|records| {
                records
                    .iter_mut()
                    .find(|r| r.get("id").and_then(JsonValue::as_str) == Some(id))
            });
        let Some(existing) = existing else {
            return Ok(write_err(404, "not found"));
        };
        let mut replacement = record.clone();
        replacement.insert("id".to_string(), json!(id));
        *existing = replacement;
        Ok(write_ok(entity, id))
    }

    async fn bulk_create(
        &self,
        entity: EntityType,
        records: &[Record],
    ) -> Result<RemoteRecord, StoreError> {
        let mut state = self.state();
        state.count("bulk_create");
        if state.rejecting.contains(&entity) {
            return Ok(write_err(422, "rejected"));
        }
        let items = records
            .iter()
            .map(|record| {
                let id = state.insert(entity, record.clone());
                JsonValue::Object(write_ok(entity, &id).into_fields())
            })
            .collect::<Vec<_>>();
        let mut fields = Record::new();
        fields.insert("_status".into(), json!(RemoteRecord::STATUS_OK));
        fields.insert("_items".into(), JsonValue::Array(items));
        Ok(RemoteRecord::new(fields))
    }

    async fn get(&self, link: &str, query: &Query) -> Result<RemoteRecord, StoreError> {
        let mut state = self.state();
        state.count("get");
        let not_found = || StoreError::NotFound(link.to_string());
        let (endpoint, id) = link
            .trim_start_matches('/')
            .rsplit_once('/')
            .ok_or_else(not_found)?;
        let endpoint = endpoint.rsplit('/').next().unwrap_or(endpoint);
        let entity = endpoint.parse::<EntityType>().map_err(|_| not_found())?;
        let by_id = Query {
            filter: Query::new().where_eq("id", json!(id)).filter,
            sort: query.sort.clone(),
            embed: query.embed.clone(),
        };
        state
            .lookup(entity, &by_id)
            .into_iter()
            .next()
            .map(RemoteRecord::new)
            .ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn create_then_find_and_update_in_place() {
        let store = MemoryStore::new();
        let created = store
            .create(EntityType::Events, &record(json!({ "identifier": "A", "name": "1" })))
            .await
            .unwrap();
        assert!(created.is_ok());
        let id = created.id().unwrap().to_string();
        assert_eq!(created.self_href(), Some(format!("events/{id}").as_str()));

        let query = Query::new().where_eq("identifier", json!("A"));
        let found = store.find_first(EntityType::Events, &query).await.unwrap().unwrap();
        assert_eq!(found.id(), Some(id.as_str()));

        store
            .update(EntityType::Events, &id, &record(json!({ "identifier": "A" })))
            .await
            .unwrap();
        let records = store.records(EntityType::Events);
        assert_eq!(records.len(), 1);
        assert!(!records[0].contains_key("name"), "update replaces the whole record");
        assert_eq!(store.calls("create"), 1);
        assert_eq!(store.calls("update"), 1);
    }

    #[tokio::test]
    async fn get_embeds_related_votes() {
        let store = MemoryStore::new();
        let ve = store.seed(EntityType::VoteEvents, record(json!({ "start_date": "2014-01-01" })));
        store.seed(EntityType::Votes, record(json!({ "vote_event_id": ve, "option": "yes" })));
        store.seed(EntityType::Votes, record(json!({ "vote_event_id": "other", "option": "no" })));

        let fetched = store
            .get(&format!("vote-events/{ve}"), &Query::new().embed("votes"))
            .await
            .unwrap();
        let votes = fetched.get("votes").and_then(JsonValue::as_array).unwrap();
        assert_eq!(votes.len(), 1);

        let missing = store.get("vote-events/nope", &Query::new()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_writes_report_error_status() {
        let store = MemoryStore::new();
        store.reject_writes(EntityType::Votes);
        let summary = store
            .bulk_create(EntityType::Votes, &[record(json!({ "option": "yes" }))])
            .await
            .unwrap();
        assert!(!summary.is_ok());
        assert_eq!(store.len(EntityType::Votes), 0);
    }
}
