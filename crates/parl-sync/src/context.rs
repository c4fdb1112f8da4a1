use std::collections::HashMap;

use parl_core::{EntityType, Record};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SyncError;
use crate::resolver::IdentifierResolver;

/// Run-scoped mapping from a local handle or natural identifier to the remote
/// id it was written under. Lookups of unknown handles fail.
#[derive(Debug, Clone)]
pub struct HandleMap {
    name: &'static str,
    entries: HashMap<String, String>,
}

impl HandleMap {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: impl Into<String>, remote_id: impl Into<String>) {
        self.entries.insert(handle.into(), remote_id.into());
    }

    pub fn get(&self, handle: &str) -> Option<&str> {
        self.entries.get(handle).map(String::as_str)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn require(&self, handle: &str) -> Result<&str, SyncError> {
        self.get(handle).ok_or_else(|| SyncError::MissingHandle {
            map: self.name,
            handle: handle.to_string(),
        })
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All mutable state of one export run. Created fresh by every run and
/// dropped when it ends.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub resolver: IdentifierResolver,
    /// Motion handle (`id` minted at staging) → remote motion id.
    pub motions: HandleMap,
    /// Event `identifier` → remote event id.
    pub events: HandleMap,
    /// Vote-event `identifier` → remote id, only for vote events whose votes
    /// are still to be submitted.
    pub vote_events: HandleMap,
    pub chamber_id: Option<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            resolver: IdentifierResolver::new(),
            motions: HandleMap::new("motion"),
            events: HandleMap::new("event"),
            vote_events: HandleMap::new("vote-event"),
            chamber_id: None,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Field value treated as set: present, not null and not an empty string.
pub(crate) fn reference<'a>(record: &'a Record, field: &str) -> Option<&'a JsonValue> {
    match record.get(field) {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) if s.is_empty() => None,
        Some(value) => Some(value),
    }
}

/// Handles are strings in staged data; numeric handles are stringified.
pub(crate) fn handle_key(
    entity: EntityType,
    field: &'static str,
    value: &JsonValue,
) -> Result<String, SyncError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(SyncError::InvalidHandle {
            entity,
            field,
            value: other.to_string(),
        }),
    }
}
