//! Stage-by-stage export of staged records to the remote store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parl_adapters::ParliamentProfile;
use parl_core::{EntityType, NaturalId, Record, Upserted};
use parl_storage::{RemoteStore, StagedReader};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{handle_key, reference, HandleMap, RunContext};
use crate::error::SyncError;
use crate::resolver::Resolution;
use crate::upsert::{batch_create, get_or_create, has_embedded_votes, UpsertOptions};

pub const DEFAULT_VOTE_CHUNK_SIZE: usize = 400;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    People,
    Organizations,
    Memberships,
    Events,
    Motions,
    Votes,
    Speeches,
}

impl Stage {
    /// Every stage, in the order a run executes them.
    pub const ALL: [Stage; 7] = [
        Stage::People,
        Stage::Organizations,
        Stage::Memberships,
        Stage::Events,
        Stage::Motions,
        Stage::Votes,
        Stage::Speeches,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::People => "people",
            Stage::Organizations => "organizations",
            Stage::Memberships => "memberships",
            Stage::Events => "events",
            Stage::Motions => "motions",
            Stage::Votes => "votes",
            Stage::Speeches => "speeches",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown stage `{0}` (expected one of people, organizations, memberships, events, motions, votes, speeches)")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Votes sent through bulk creates.
    pub submitted: usize,
    /// Vote events whose votes were not sent because they already had some.
    pub withheld: usize,
}

impl StageStats {
    fn record(&mut self, upserted: &Upserted) {
        if upserted.created {
            self.created += 1;
        } else {
            self.updated += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub parliament: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: BTreeMap<Stage, StageStats>,
}

impl ExportSummary {
    pub fn stage(&self, stage: Stage) -> StageStats {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn total_created(&self) -> usize {
        self.stages.values().map(|s| s.created).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub stages: BTreeSet<Stage>,
    /// Which of the profile's chambers records hang off.
    pub chamber_index: usize,
    pub vote_chunk_size: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            stages: Stage::ALL.into_iter().collect(),
            chamber_index: 0,
            vote_chunk_size: DEFAULT_VOTE_CHUNK_SIZE,
        }
    }
}

impl ExportOptions {
    pub fn only(stages: impl IntoIterator<Item = Stage>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Groups an iterator's items into vectors of at most `size` elements.
pub struct Chunks<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Chunks<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.by_ref().take(self.size).collect::<Vec<_>>();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

pub fn chunks<I: IntoIterator>(iter: I, size: usize) -> Chunks<I::IntoIter> {
    Chunks {
        inner: iter.into_iter(),
        size: size.max(1),
    }
}

fn natural_reference(
    record: &Record,
    field: &'static str,
) -> Result<Option<NaturalId>, SyncError> {
    Ok(reference(record, field)
        .map(|value| NaturalId::from_value(field, value))
        .transpose()?)
}

fn local_handle(
    entity: EntityType,
    record: &Record,
    field: &'static str,
) -> Result<Option<String>, SyncError> {
    reference(record, field)
        .map(|value| handle_key(entity, field, value))
        .transpose()
}

fn rewrite_through(
    map: &HandleMap,
    entity: EntityType,
    record: &mut Record,
    field: &'static str,
) -> Result<(), SyncError> {
    if let Some(handle) = local_handle(entity, record, field)? {
        let remote = map.require(&handle)?.to_string();
        record.insert(field.to_string(), json!(remote));
    }
    Ok(())
}

/// Exports one parliament's staged records, stage by stage, in dependency
/// order. Every run starts from empty handle maps and an empty resolver cache.
pub struct Exporter {
    store: Arc<dyn RemoteStore>,
    reader: StagedReader,
    profile: Box<dyn ParliamentProfile>,
    options: ExportOptions,
}

impl Exporter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        reader: StagedReader,
        profile: Box<dyn ParliamentProfile>,
    ) -> Self {
        Self {
            store,
            reader,
            profile,
            options: ExportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn profile(&self) -> &dyn ParliamentProfile {
        self.profile.as_ref()
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    pub async fn run_export(&self) -> Result<ExportSummary, SyncError> {
        let mut ctx = RunContext::new();
        let span = info_span!("export", run_id = %ctx.run_id, parliament = %self.profile.code());
        self.run_stages(&mut ctx).instrument(span).await
    }

    async fn run_stages(&self, ctx: &mut RunContext) -> Result<ExportSummary, SyncError> {
        let started_at = Utc::now();
        let mut stages = BTreeMap::new();

        for stage in Stage::ALL {
            if !self.options.stages.contains(&stage) {
                continue;
            }
            info!(%stage, "exporting {stage}");
            let stats = match stage {
                Stage::People => self.export_people(ctx).await?,
                Stage::Organizations => self.export_organizations(ctx).await?,
                Stage::Memberships => self.export_memberships(ctx).await?,
                Stage::Events => self.export_events(ctx).await?,
                Stage::Motions => self.export_motions(ctx).await?,
                Stage::Votes => self.export_votes(ctx).await?,
                Stage::Speeches => self.export_speeches(ctx).await?,
            };
            info!(
                %stage,
                created = stats.created,
                updated = stats.updated,
                skipped = stats.skipped,
                submitted = stats.submitted,
                withheld = stats.withheld,
                "finished {stage}"
            );
            stages.insert(stage, stats);
        }

        Ok(ExportSummary {
            run_id: ctx.run_id,
            parliament: self.profile.code().to_string(),
            started_at,
            finished_at: Utc::now(),
            stages,
        })
    }

    fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    async fn upsert(&self, entity: EntityType, record: &Record) -> Result<Upserted, SyncError> {
        get_or_create(self.store(), entity, record, &UpsertOptions::default()).await
    }

    /// Remote id of the chamber, upserted on first use in a run.
    async fn chamber_id(&self, ctx: &mut RunContext) -> Result<String, SyncError> {
        if let Some(id) = &ctx.chamber_id {
            return Ok(id.clone());
        }
        let chamber = self.profile.chamber(self.options.chamber_index)?;
        let upserted = self.upsert(EntityType::Organizations, &chamber).await?;
        debug!(chamber_id = %upserted.id, "chamber ready");
        ctx.chamber_id = Some(upserted.id.clone());
        Ok(upserted.id)
    }

    async fn export_people(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let mut stats = StageStats::default();
        for person in self.reader.read(EntityType::People)? {
            let person = person?;
            let upserted = self.upsert(EntityType::People, &person).await?;
            stats.record(&upserted);

            if self.profile.single_chamber() {
                let chamber = self.chamber_id(ctx).await?;
                let mut membership = Record::new();
                membership.insert("person_id".into(), json!(upserted.id));
                membership.insert("organization_id".into(), json!(chamber));
                self.upsert(EntityType::Memberships, &membership).await?;
            }
        }
        Ok(stats)
    }

    async fn export_organizations(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let entity = EntityType::Organizations;
        let mut stats = StageStats::default();
        let has_parent = |org: &Record| reference(org, "parent_id").is_some();

        for organization in self.reader.read_excluding(entity, has_parent)? {
            let mut organization = organization?;
            if self.profile.single_chamber() {
                let chamber = self.chamber_id(ctx).await?;
                organization.insert("parent_id".into(), json!(chamber));
            }
            let upserted = self.upsert(entity, &organization).await?;
            stats.record(&upserted);
        }

        // Parents staged anywhere in the file exist remotely by now.
        for organization in self
            .reader
            .read_excluding(entity, |org: &Record| !has_parent(org))?
        {
            let mut organization = organization?;
            let Some(parent) = natural_reference(&organization, "parent_id")? else {
                continue;
            };
            let resolution = ctx.resolver.resolve(self.store(), &parent).await?;
            let Resolution::Resolved(parent_id) = resolution else {
                return Err(SyncError::UnresolvedReference {
                    entity,
                    field: "parent_id",
                    reference: parent,
                });
            };
            organization.insert("parent_id".into(), json!(parent_id));
            let upserted = self.upsert(entity, &organization).await?;
            stats.record(&upserted);
        }
        Ok(stats)
    }

    async fn export_memberships(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let entity = EntityType::Memberships;
        let mut stats = StageStats::default();
        for membership in self.reader.read(entity)? {
            let mut membership = membership?;
            let person = natural_reference(&membership, "person_id")?
                .ok_or_else(|| SyncError::missing_field(entity, "person_id"))?;
            let organization = natural_reference(&membership, "organization_id")?
                .ok_or_else(|| SyncError::missing_field(entity, "organization_id"))?;

            let person_id = ctx.resolver.resolve(self.store(), &person).await?;
            let organization_id = ctx.resolver.resolve(self.store(), &organization).await?;
            let (Resolution::Resolved(person_id), Resolution::Resolved(organization_id)) =
                (person_id, organization_id)
            else {
                debug!(person = %person, organization = %organization, "skipping membership with unresolved side");
                stats.skipped += 1;
                continue;
            };

            membership.insert("person_id".into(), json!(person_id));
            membership.insert("organization_id".into(), json!(organization_id));
            let upserted = self.upsert(entity, &membership).await?;
            stats.record(&upserted);
        }
        Ok(stats)
    }

    async fn export_events(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let entity = EntityType::Events;
        let mut stats = StageStats::default();
        let has_parent = |event: &Record| reference(event, "parent_id").is_some();

        for event in self.reader.read_excluding(entity, has_parent)? {
            let mut event = event?;
            let identifier = local_handle(entity, &event, "identifier")?
                .ok_or_else(|| SyncError::missing_field(entity, "identifier"))?;
            let chamber = self.chamber_id(ctx).await?;
            event.insert("organization_id".into(), json!(chamber));
            let upserted = self.upsert(entity, &event).await?;
            stats.record(&upserted);
            ctx.events.insert(identifier, upserted.id);
        }

        // Children see only top-level events as parents.
        let parents = ctx.events.clone();
        for event in self
            .reader
            .read_excluding(entity, |event: &Record| !has_parent(event))?
        {
            let mut event = event?;
            let identifier = local_handle(entity, &event, "identifier")?
                .ok_or_else(|| SyncError::missing_field(entity, "identifier"))?;
            rewrite_through(&parents, entity, &mut event, "parent_id")?;
            let chamber = self.chamber_id(ctx).await?;
            event.insert("organization_id".into(), json!(chamber));
            let upserted = self.upsert(entity, &event).await?;
            stats.record(&upserted);
            ctx.events.insert(identifier, upserted.id);
        }
        Ok(stats)
    }

    async fn export_motions(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let entity = EntityType::Motions;
        let mut stats = StageStats::default();
        for motion in self.reader.read(entity)? {
            let mut motion = motion?;
            let chamber = self.chamber_id(ctx).await?;
            motion.insert("organization_id".into(), json!(chamber));
            let handle = match motion.remove("id") {
                Some(JsonValue::Null) | None => None,
                Some(value) => Some(handle_key(entity, "id", &value)?),
            };
            rewrite_through(&ctx.events, entity, &mut motion, "legislative_session_id")?;

            let upserted = self.upsert(entity, &motion).await?;
            stats.record(&upserted);
            if let Some(handle) = handle {
                ctx.motions.insert(handle, upserted.id);
            }
        }
        Ok(stats)
    }

    async fn export_votes(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let mut stats = StageStats::default();

        let entity = EntityType::VoteEvents;
        for vote_event in self.reader.read(entity)? {
            let mut vote_event = vote_event?;
            let identifier = vote_event
                .remove("identifier")
                .ok_or_else(|| SyncError::missing_field(entity, "identifier"))
                .and_then(|value| handle_key(entity, "identifier", &value))?;
            if reference(&vote_event, "motion_id").is_some() {
                rewrite_through(&ctx.motions, entity, &mut vote_event, "motion_id")?;
            } else {
                vote_event.remove("motion_id");
            }
            rewrite_through(&ctx.events, entity, &mut vote_event, "legislative_session_id")?;

            let upserted =
                get_or_create(self.store(), entity, &vote_event, &UpsertOptions::refreshed())
                    .await?;
            stats.record(&upserted);
            if has_embedded_votes(&upserted.record) {
                debug!(vote_event = %identifier, "votes already present");
                stats.withheld += 1;
            } else {
                ctx.vote_events.insert(identifier, upserted.id);
            }
        }

        let entity = EntityType::Votes;
        let registered = &ctx.vote_events;
        let pending = move |vote: &Record| {
            local_handle(entity, vote, "vote_event_id")
                .ok()
                .flatten()
                .is_some_and(|handle| registered.contains(&handle))
        };
        let votes = self
            .reader
            .read_excluding(entity, move |vote: &Record| !pending(vote))?;

        for chunk in chunks(votes, self.options.vote_chunk_size) {
            let mut batch = Vec::with_capacity(chunk.len());
            for vote in chunk {
                let mut vote = vote?;
                rewrite_through(registered, entity, &mut vote, "vote_event_id")?;
                let voter = natural_reference(&vote, "voter_id")?
                    .ok_or_else(|| SyncError::missing_field(entity, "voter_id"))?;
                let Resolution::Resolved(voter_id) =
                    ctx.resolver.resolve(self.store(), &voter).await?
                else {
                    return Err(SyncError::UnresolvedReference {
                        entity,
                        field: "voter_id",
                        reference: voter,
                    });
                };
                vote.insert("voter_id".into(), json!(voter_id));
                batch.push(vote);
            }
            stats.submitted += batch_create(self.store(), entity, &batch).await?;
        }
        Ok(stats)
    }

    async fn export_speeches(&self, ctx: &mut RunContext) -> Result<StageStats, SyncError> {
        let entity = EntityType::Speeches;
        let mut stats = StageStats::default();
        for speech in self.reader.read(entity)? {
            let mut speech = speech?;
            if let Some(creator) = natural_reference(&speech, "creator_id")? {
                match ctx.resolver.resolve(self.store(), &creator).await? {
                    Resolution::Resolved(creator_id) => {
                        speech.insert("creator_id".into(), json!(creator_id));
                    }
                    Resolution::Unresolved => {
                        warn!(creator = %creator, "speech creator not found remotely; omitting creator_id");
                        speech.remove("creator_id");
                    }
                }
            }
            rewrite_through(&ctx.events, entity, &mut speech, "event_id")?;
            let upserted = self.upsert(entity, &speech).await?;
            stats.record(&upserted);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_parse_case_insensitively() {
        assert_eq!("Votes".parse::<Stage>().unwrap(), Stage::Votes);
        assert_eq!(" people ".parse::<Stage>().unwrap(), Stage::People);
        assert!("bills".parse::<Stage>().is_err());
    }

    #[test]
    fn stage_order_follows_dependencies() {
        let mut sorted = Stage::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ALL.to_vec());
        assert!(Stage::Events < Stage::Motions && Stage::Motions < Stage::Votes);
    }

    #[test]
    fn chunks_split_with_short_tail() {
        let sizes = chunks(0..1000, 400).map(|c| c.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![400, 400, 200]);
        assert_eq!(chunks(Vec::<u8>::new(), 400).count(), 0);
        assert_eq!(chunks(0..3, 0).count(), 3);
    }

    #[test]
    fn summary_serializes_stage_names() {
        let mut stages = BTreeMap::new();
        stages.insert(
            Stage::Votes,
            StageStats {
                submitted: 700,
                withheld: 1,
                ..StageStats::default()
            },
        );
        let summary = ExportSummary {
            run_id: Uuid::new_v4(),
            parliament: "PL_SEJM".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stages,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["stages"]["votes"]["submitted"], json!(700));
        assert_eq!(summary.stage(Stage::People), StageStats::default());
    }
}
