use std::collections::HashMap;

use parl_core::{NaturalId, Query};
use parl_storage::RemoteStore;
use tracing::debug;

use crate::error::SyncError;

/// Whether a natural identifier is known to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Unresolved,
}

/// Memoizing natural-identifier → remote id lookup.
///
/// Each distinct pair is queried at most once per run; both hits and misses
/// are remembered and never re-verified.
#[derive(Debug, Default)]
pub struct IdentifierResolver {
    cache: HashMap<NaturalId, Option<String>>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &mut self,
        store: &dyn RemoteStore,
        id: &NaturalId,
    ) -> Result<Resolution, SyncError> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(match cached {
                Some(remote_id) => Resolution::Resolved(remote_id.clone()),
                None => Resolution::Unresolved,
            });
        }

        let entity = id.entity_type()?;
        let query = Query::new().where_elem_match("identifiers", id.to_value());
        let found = store.find_many(entity, &query).await?;
        let remote_id = found
            .first()
            .and_then(|record| record.id())
            .map(str::to_string);
        debug!(natural_id = %id, %entity, remote_id = ?remote_id, "resolved identifier");
        self.cache.insert(id.clone(), remote_id.clone());

        Ok(match remote_id {
            Some(remote_id) => Resolution::Resolved(remote_id),
            None => Resolution::Unresolved,
        })
    }

    #[cfg(test)]
    fn cached(&self, id: &NaturalId) -> Option<&str> {
        self.cache.get(id).and_then(|hit| hit.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parl_core::{CoreError, EntityType, Record};
    use parl_storage::MemoryStore;
    use serde_json::json;

    fn person(scheme: &str, identifier: &str) -> Record {
        json!({
            "name": "Jan Kowalski",
            "identifiers": [{ "scheme": scheme, "identifier": identifier }]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_store_once() {
        let store = MemoryStore::new();
        let remote = store.seed(EntityType::People, person("mojepanstwo.pl/people", "411"));
        let mut resolver = IdentifierResolver::new();
        let id = NaturalId::new("mojepanstwo.pl/people", "411");

        for _ in 0..3 {
            let resolution = resolver.resolve(&store, &id).await.unwrap();
            assert_eq!(resolution, Resolution::Resolved(remote.clone()));
        }
        assert_eq!(store.calls("find_many"), 1);
        assert_eq!(resolver.cached(&id), Some(remote.as_str()));
    }

    #[tokio::test]
    async fn misses_are_unresolved_and_remembered() {
        let store = MemoryStore::new();
        let mut resolver = IdentifierResolver::new();
        let id = NaturalId::new("mojepanstwo.pl/people", "999");

        assert_eq!(resolver.resolve(&store, &id).await.unwrap(), Resolution::Unresolved);
        assert_eq!(resolver.resolve(&store, &id).await.unwrap(), Resolution::Unresolved);
        assert_eq!(store.calls("find_many"), 1);
        assert_eq!(resolver.cached(&id), None);
    }

    #[tokio::test]
    async fn party_scheme_resolves_against_organizations() {
        let store = MemoryStore::new();
        let party = store.seed(
            EntityType::Organizations,
            person("mojepanstwo.pl/parties", "3"),
        );
        store.seed(EntityType::People, person("mojepanstwo.pl/parties", "3"));
        let mut resolver = IdentifierResolver::new();
        let resolution = resolver
            .resolve(&store, &NaturalId::new("mojepanstwo.pl/parties", "3"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Resolved(party));
    }

    #[tokio::test]
    async fn numeric_identifiers_match_as_numbers() {
        let store = MemoryStore::new();
        let staged = json!({ "scheme": "mojepanstwo.pl/people", "identifier": 411 });
        let remote = store.seed(
            EntityType::People,
            json!({ "identifiers": [staged] }).as_object().cloned().unwrap(),
        );
        let mut resolver = IdentifierResolver::new();

        let numeric = NaturalId::from_value("person_id", &staged).unwrap();
        assert_eq!(
            resolver.resolve(&store, &numeric).await.unwrap(),
            Resolution::Resolved(remote)
        );
        let textual = NaturalId::new("mojepanstwo.pl/people", "411");
        assert_eq!(resolver.resolve(&store, &textual).await.unwrap(), Resolution::Unresolved);
    }

    #[tokio::test]
    async fn identifier_match_requires_both_scheme_and_identifier() {
        let store = MemoryStore::new();
        store.seed(EntityType::People, person("senat.gov.pl/people", "411"));
        let mut resolver = IdentifierResolver::new();
        let resolution = resolver
            .resolve(&store, &NaturalId::new("mojepanstwo.pl/people", "411"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Unresolved);
    }

    #[tokio::test]
    async fn unknown_category_fails_without_querying() {
        let store = MemoryStore::new();
        let mut resolver = IdentifierResolver::new();
        let err = resolver
            .resolve(&store, &NaturalId::new("mojepanstwo.pl/clubs", "1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Core(CoreError::UnknownSchemeCategory { .. })
        ));
        assert_eq!(store.calls("find_many"), 0);
    }
}
