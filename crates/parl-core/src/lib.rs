//! Core domain model for staged parliamentary records and their remote representation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "parl-core";

/// A staged or submitted record: one JSON object.
pub type Record = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed scheme `{0}`: expected `<domain>/<category>`")]
    MalformedScheme(String),
    #[error("scheme `{scheme}` has category `{category}` which maps to no remote entity type")]
    UnknownSchemeCategory { scheme: String, category: String },
    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),
    #[error("malformed reference in `{field}`: {reason}")]
    MalformedReference { field: String, reason: String },
}

/// Remote collections the exporter writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    People,
    Organizations,
    Memberships,
    Events,
    Motions,
    VoteEvents,
    Votes,
    Speeches,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::People,
        EntityType::Organizations,
        EntityType::Memberships,
        EntityType::Events,
        EntityType::Motions,
        EntityType::VoteEvents,
        EntityType::Votes,
        EntityType::Speeches,
    ];

    /// Collection name on the remote store.
    pub fn endpoint(self) -> &'static str {
        match self {
            EntityType::People => "people",
            EntityType::Organizations => "organizations",
            EntityType::Memberships => "memberships",
            EntityType::Events => "events",
            EntityType::Motions => "motions",
            EntityType::VoteEvents => "vote-events",
            EntityType::Votes => "votes",
            EntityType::Speeches => "speeches",
        }
    }

    /// File name of the newline-delimited staging file for this type.
    pub fn staged_file(self) -> &'static str {
        match self {
            EntityType::People => "Person.json",
            EntityType::Organizations => "Organization.json",
            EntityType::Memberships => "Membership.json",
            EntityType::Events => "Event.json",
            EntityType::Motions => "Motion.json",
            EntityType::VoteEvents => "VoteEvent.json",
            EntityType::Votes => "Vote.json",
            EntityType::Speeches => "Speech.json",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.endpoint() == s)
            .ok_or_else(|| CoreError::UnknownEntityType(s.to_string()))
    }
}

/// Maps the category half of a `<domain>/<category>` scheme to the collection
/// holding entities identified under that scheme.
pub fn entity_type_for_category(category: &str) -> Option<EntityType> {
    match category {
        "people" => Some(EntityType::People),
        "organizations" | "committees" | "parties" | "chamber" => Some(EntityType::Organizations),
        "memberships" => Some(EntityType::Memberships),
        "events" => Some(EntityType::Events),
        "motions" => Some(EntityType::Motions),
        "vote-events" => Some(EntityType::VoteEvents),
        "votes" => Some(EntityType::Votes),
        "speeches" => Some(EntityType::Speeches),
        _ => None,
    }
}

/// An entity's identifier in its original source, e.g.
/// `mojepanstwo.pl/people` + `123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalId {
    pub scheme: String,
    pub identifier: String,
    /// The identifier was staged as a JSON number and is matched as one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub numeric: bool,
}

impl NaturalId {
    pub fn new(scheme: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            identifier: identifier.into(),
            numeric: false,
        }
    }

    pub fn numeric(scheme: impl Into<String>, identifier: serde_json::Number) -> Self {
        Self {
            scheme: scheme.into(),
            identifier: identifier.to_string(),
            numeric: true,
        }
    }

    /// Parses an embedded `{scheme, identifier}` reference. Numeric identifiers
    /// keep their JSON type so lookups match the staged value exactly.
    pub fn from_value(field: &str, value: &JsonValue) -> Result<Self, CoreError> {
        let malformed = |reason: &str| CoreError::MalformedReference {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let object = value
            .as_object()
            .ok_or_else(|| malformed("expected an object with `scheme` and `identifier`"))?;
        let scheme = object
            .get("scheme")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| malformed("missing string `scheme`"))?;
        match object.get("identifier") {
            Some(JsonValue::String(s)) => Ok(Self::new(scheme, s.clone())),
            Some(JsonValue::Number(n)) => Ok(Self::numeric(scheme, n.clone())),
            _ => Err(malformed("missing string or numeric `identifier`")),
        }
    }

    pub fn category(&self) -> Result<&str, CoreError> {
        match self.scheme.split_once('/') {
            Some((domain, category))
                if !domain.is_empty() && !category.is_empty() && !category.contains('/') =>
            {
                Ok(category)
            }
            _ => Err(CoreError::MalformedScheme(self.scheme.clone())),
        }
    }

    /// Remote collection that holds entities identified under this scheme.
    pub fn entity_type(&self) -> Result<EntityType, CoreError> {
        let category = self.category()?;
        entity_type_for_category(category).ok_or_else(|| CoreError::UnknownSchemeCategory {
            scheme: self.scheme.clone(),
            category: category.to_string(),
        })
    }

    pub fn to_value(&self) -> JsonValue {
        let identifier = if self.numeric {
            serde_json::from_str::<JsonValue>(&self.identifier)
                .ok()
                .filter(JsonValue::is_number)
                .unwrap_or_else(|| json!(self.identifier))
        } else {
            json!(self.identifier)
        };
        json!({ "scheme": self.scheme, "identifier": identifier })
    }
}

impl fmt::Display for NaturalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scheme, self.identifier)
    }
}

/// A record as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord(pub Record);

impl RemoteRecord {
    pub const STATUS_OK: &'static str = "OK";

    pub fn new(fields: Record) -> Self {
        Self(fields)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(JsonValue::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("_status").and_then(JsonValue::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Some(Self::STATUS_OK)
    }

    pub fn self_href(&self) -> Option<&str> {
        self.0
            .get("_links")
            .and_then(|links| links.get("self"))
            .and_then(|link| link.get("href"))
            .and_then(JsonValue::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Items of a listing or bulk-create response.
    pub fn items(&self) -> &[JsonValue] {
        self.0
            .get("_items")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn fields(&self) -> &Record {
        &self.0
    }

    pub fn into_fields(self) -> Record {
        self.0
    }
}

/// Outcome of an upsert: the remote representation and whether it was created.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub id: String,
    pub created: bool,
    pub record: RemoteRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn direction(self) -> i8 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

/// A Mongo-style lookup: `where` filter, sort keys and embedded sub-collections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filter: Record,
    pub sort: Vec<(String, SortOrder)>,
    pub embed: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    pub fn where_missing(mut self, field: impl Into<String>) -> Self {
        self.filter.insert(field.into(), json!({ "$exists": false }));
        self
    }

    pub fn where_elem_match(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.filter.insert(field.into(), json!({ "$elemMatch": value }));
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn embed(mut self, collection: impl Into<String>) -> Self {
        self.embed.push(collection.into());
        self
    }

    pub fn where_param(&self) -> String {
        JsonValue::Object(self.filter.clone()).to_string()
    }

    /// Sort in the store's `[("field", -1)]` notation.
    pub fn sort_param(&self) -> Option<String> {
        if self.sort.is_empty() {
            return None;
        }
        let keys = self
            .sort
            .iter()
            .map(|(field, order)| format!("(\"{}\", {})", field, order.direction()))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("[{keys}]"))
    }

    pub fn embedded_param(&self) -> Option<String> {
        if self.embed.is_empty() {
            return None;
        }
        let embedded = self
            .embed
            .iter()
            .map(|name| (name.clone(), json!(1)))
            .collect::<Record>();
        Some(JsonValue::Object(embedded).to_string())
    }

    /// Evaluates the filter against a record the way the store does.
    pub fn matches(&self, record: &Record) -> bool {
        self.filter.iter().all(|(path, condition)| {
            let values = values_at_path(record, path);
            match condition {
                JsonValue::Object(ops) if ops.contains_key("$exists") => {
                    let expected = ops.get("$exists").and_then(JsonValue::as_bool).unwrap_or(true);
                    !values.is_empty() == expected
                }
                JsonValue::Object(ops) if ops.contains_key("$elemMatch") => {
                    let Some(JsonValue::Object(wanted)) = ops.get("$elemMatch") else {
                        return false;
                    };
                    values.iter().any(|value| match value {
                        JsonValue::Array(elements) => {
                            elements.iter().any(|element| contains_fields(element, wanted))
                        }
                        other => contains_fields(other, wanted),
                    })
                }
                expected => values.iter().any(|value| match value {
                    JsonValue::Array(elements) if !expected.is_array() => {
                        elements.contains(expected)
                    }
                    other => *other == expected,
                }),
            }
        })
    }

    /// Orders two records by the query's sort keys. Missing values sort first.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for (field, order) in &self.sort {
            let ordering = compare_values(
                values_at_path(a, field).first().copied(),
                values_at_path(b, field).first().copied(),
            );
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn values_at_path<'a>(record: &'a Record, path: &str) -> Vec<&'a JsonValue> {
    let parts = path.split('.').collect::<Vec<_>>();
    let mut out = Vec::new();
    if let Some(first) = record.get(parts[0]) {
        collect_path(first, &parts[1..], &mut out);
    }
    out
}

fn collect_path<'a>(value: &'a JsonValue, parts: &[&str], out: &mut Vec<&'a JsonValue>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        JsonValue::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect_path(next, rest, out);
            }
        }
        JsonValue::Array(elements) => {
            for element in elements {
                collect_path(element, parts, out);
            }
        }
        _ => {}
    }
}

fn contains_fields(value: &JsonValue, wanted: &Record) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    wanted
        .iter()
        .all(|(key, expected)| object.get(key) == Some(expected))
}

fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
