//! Export of staged parliamentary records into the remote document store.

mod config;
mod context;
mod error;
mod export;
mod resolver;
mod upsert;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

pub use config::{password_from_env, SyncConfig};
pub use context::{HandleMap, RunContext};
pub use error::SyncError;
pub use export::{
    chunks, Chunks, ExportOptions, ExportSummary, Exporter, Stage, StageStats, UnknownStage,
    DEFAULT_VOTE_CHUNK_SIZE,
};
pub use resolver::{IdentifierResolver, Resolution};
pub use upsert::{batch_create, get_or_create, lookup_query, UpsertOptions};

pub const CRATE_NAME: &str = "parl-sync";

/// Runs an export of `parliament` against the HTTP store configured by the
/// environment.
pub async fn run_export_from_env(
    parliament: &str,
    options: ExportOptions,
) -> Result<ExportSummary> {
    let config = SyncConfig::from_env();
    let profile = config.profile(parliament)?;
    let store = config.http_store(profile.as_ref())?;
    let reader = config.staged_reader(profile.as_ref());
    info!(
        base_url = store.base_url(),
        root = %reader.root().display(),
        "exporting to server"
    );
    let exporter = Exporter::new(Arc::new(store), reader, profile).with_options(options);
    exporter
        .run_export()
        .await
        .with_context(|| format!("exporting {parliament}"))
}
