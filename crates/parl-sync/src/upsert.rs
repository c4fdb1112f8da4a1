//! Create-or-update against the remote store, keyed per entity type.

use parl_core::{EntityType, Query, Record, RemoteRecord, SortOrder, Upserted};
use parl_storage::RemoteStore;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Re-fetch the written record through its self link, honoring the
    /// lookup's sort and embed.
    pub refresh: bool,
    /// Match on these fields instead of the entity type's default key.
    pub key_fields: Option<Vec<String>>,
}

impl UpsertOptions {
    pub fn refreshed() -> Self {
        Self {
            refresh: true,
            key_fields: None,
        }
    }

    pub fn keyed_by<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            refresh: false,
            key_fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

fn required<'a>(
    entity: EntityType,
    record: &'a Record,
    field: &str,
) -> Result<&'a JsonValue, SyncError> {
    record
        .get(field)
        .ok_or_else(|| SyncError::missing_field(entity, field))
}

/// The query that finds the remote counterpart of `record`.
pub fn lookup_query(
    entity: EntityType,
    record: &Record,
    key_fields: Option<&[String]>,
) -> Result<Query, SyncError> {
    if let Some(fields) = key_fields {
        return fields.iter().try_fold(Query::new(), |query, field| {
            Ok(query.where_eq(field.clone(), required(entity, record, field)?.clone()))
        });
    }

    let query = match entity {
        EntityType::Memberships => {
            let query = Query::new()
                .where_eq("person_id", required(entity, record, "person_id")?.clone())
                .where_eq(
                    "organization_id",
                    required(entity, record, "organization_id")?.clone(),
                );
            let query = match record.get("start_date") {
                Some(start) => query.where_eq("start_date", start.clone()),
                None => query.where_missing("start_date"),
            };
            query.sort_by("start_date", SortOrder::Descending)
        }
        EntityType::Motions | EntityType::Speeches => {
            let url = record
                .get("sources")
                .and_then(JsonValue::as_array)
                .and_then(|sources| sources.first())
                .and_then(|source| source.get("url"))
                .ok_or_else(|| SyncError::missing_field(entity, "sources.url"))?;
            Query::new().where_eq("sources.url", url.clone())
        }
        EntityType::VoteEvents => {
            let query = match record.get("motion_id") {
                Some(motion) => Query::new().where_eq("motion_id", motion.clone()),
                None => Query::new()
                    .where_eq("start_date", required(entity, record, "start_date")?.clone()),
            };
            query.embed("votes")
        }
        EntityType::Votes => Query::new()
            .where_eq(
                "vote_event_id",
                required(entity, record, "vote_event_id")?.clone(),
            )
            .where_eq("voter_id", required(entity, record, "voter_id")?.clone()),
        EntityType::Events => {
            Query::new().where_eq("identifier", required(entity, record, "identifier")?.clone())
        }
        EntityType::People | EntityType::Organizations => {
            let first = record
                .get("identifiers")
                .and_then(JsonValue::as_array)
                .and_then(|identifiers| identifiers.first())
                .ok_or_else(|| SyncError::missing_field(entity, "identifiers"))?;
            Query::new().where_elem_match("identifiers", first.clone())
        }
    };
    Ok(query)
}

fn checked(entity: EntityType, response: RemoteRecord) -> Result<RemoteRecord, SyncError> {
    if response.is_ok() {
        Ok(response)
    } else {
        Err(SyncError::Rejected {
            entity,
            status: response.status().map(str::to_string),
            body: JsonValue::Object(response.into_fields()).to_string(),
        })
    }
}

/// Finds the remote record matching `record`'s key and replaces it, or creates
/// it when there is none.
pub async fn get_or_create(
    store: &dyn RemoteStore,
    entity: EntityType,
    record: &Record,
    options: &UpsertOptions,
) -> Result<Upserted, SyncError> {
    let query = lookup_query(entity, record, options.key_fields.as_deref())?;

    let (response, created) = match store.find_first(entity, &query).await? {
        None => (store.create(entity, record).await?, true),
        Some(existing) => {
            let id = existing.id().ok_or_else(|| SyncError::MissingId {
                entity,
                body: JsonValue::Object(existing.fields().clone()).to_string(),
            })?;
            (store.update(entity, id, record).await?, false)
        }
    };
    let response = checked(entity, response)?;
    let id = response
        .id()
        .map(str::to_string)
        .ok_or_else(|| SyncError::MissingId {
            entity,
            body: JsonValue::Object(response.fields().clone()).to_string(),
        })?;
    let link = response
        .self_href()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/{}", entity.endpoint(), id));
    if created {
        debug!(%entity, link = %link, "created");
    } else {
        debug!(%entity, link = %link, "updated");
    }

    let record = if options.refresh {
        store.get(&link, &query).await?
    } else {
        response
    };
    Ok(Upserted {
        id,
        created,
        record,
    })
}

/// Sends `records` as one bulk create. Returns how many were created.
pub async fn batch_create(
    store: &dyn RemoteStore,
    entity: EntityType,
    records: &[Record],
) -> Result<usize, SyncError> {
    if records.is_empty() {
        return Ok(0);
    }
    let response = checked(entity, store.bulk_create(entity, records).await?)?;
    let created = match response.items().len() {
        0 => records.len(),
        n => n,
    };
    debug!(%entity, created, "batch created");
    Ok(created)
}

/// Whether a refreshed vote event already carries votes.
pub(crate) fn has_embedded_votes(record: &RemoteRecord) -> bool {
    match record.get("votes") {
        Some(JsonValue::Array(votes)) => !votes.is_empty(),
        Some(JsonValue::Null) | None => false,
        Some(_) => true,
    }
}
