use parl_adapters::ProfileError;
use parl_core::{CoreError, EntityType, NaturalId};
use parl_storage::{StagedError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{entity} write rejected (status {status:?}): {body}")]
    Rejected {
        entity: EntityType,
        status: Option<String>,
        body: String,
    },
    #[error("{entity} response carries no id: {body}")]
    MissingId { entity: EntityType, body: String },
    #[error("{entity} record lacks `{field}`")]
    MissingField { entity: EntityType, field: String },
    #[error("{entity} `{field}` is not a usable handle: {value}")]
    InvalidHandle {
        entity: EntityType,
        field: &'static str,
        value: String,
    },
    #[error("no {map} handle `{handle}` in this run")]
    MissingHandle { map: &'static str, handle: String },
    #[error("{entity} `{field}` references {reference}, which does not exist remotely")]
    UnresolvedReference {
        entity: EntityType,
        field: &'static str,
        reference: NaturalId,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Staged(#[from] StagedError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl SyncError {
    pub(crate) fn missing_field(entity: EntityType, field: &str) -> Self {
        SyncError::MissingField {
            entity,
            field: field.to_string(),
        }
    }
}
