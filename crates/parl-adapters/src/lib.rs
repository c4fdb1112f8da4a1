//! Parliament profiles: where a parliament's staged data lives, which remote
//! endpoint it syncs to, and the chamber its records hang off.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use parl_core::{NaturalId, Record};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "parl-adapters";

pub const DEFAULT_USER: &str = "scraper";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("{code} has no chamber at index {index} ({available} configured)")]
    NoSuchChamber {
        code: String,
        index: usize,
        available: usize,
    },
}

/// Per-parliament export settings.
pub trait ParliamentProfile: Send + Sync {
    /// Short code such as `PL_SEJM`; also names the password variable.
    fn code(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Namespace directory of the staged files, usually the scraped site.
    fn domain(&self) -> &str;

    /// Parliament path on the remote server, e.g. `pl/sejm`.
    fn endpoint(&self) -> &str;

    fn user(&self) -> &str {
        DEFAULT_USER
    }

    /// Whether people and parentless organizations belong to the chamber.
    fn single_chamber(&self) -> bool {
        true
    }

    /// Organization record of the chamber for parliamentary term `index`.
    fn chamber(&self, index: usize) -> Result<Record, ProfileError>;

    fn password_var(&self) -> String {
        format!("VPAPI_PWD_{}", self.code().to_uppercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParliamentRegistry {
    pub parliaments: Vec<ParliamentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParliamentConfig {
    pub code: String,
    pub display_name: String,
    pub domain: String,
    pub endpoint: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_single_chamber")]
    pub single_chamber: bool,
    pub chambers: Vec<ChamberConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberConfig {
    pub name: String,
    /// Identifier under the `<domain>/chamber` scheme.
    pub identifier: String,
    #[serde(default = "default_classification")]
    pub classification: String,
    #[serde(default)]
    pub founding_date: Option<String>,
    #[serde(default)]
    pub dissolution_date: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_single_chamber() -> bool {
    true
}

fn default_classification() -> String {
    "chamber".to_string()
}

impl ParliamentProfile for ParliamentConfig {
    fn code(&self) -> &str {
        &self.code
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn single_chamber(&self) -> bool {
        self.single_chamber
    }

    fn chamber(&self, index: usize) -> Result<Record, ProfileError> {
        let chamber = self
            .chambers
            .get(index)
            .ok_or_else(|| ProfileError::NoSuchChamber {
                code: self.code.clone(),
                index,
                available: self.chambers.len(),
            })?;
        let scheme = format!("{}/chamber", self.domain);
        let mut record = Record::new();
        record.insert("name".into(), json!(chamber.name));
        record.insert("classification".into(), json!(chamber.classification));
        record.insert(
            "identifiers".into(),
            json!([NaturalId::new(scheme, chamber.identifier.clone()).to_value()]),
        );
        if let Some(date) = &chamber.founding_date {
            record.insert("founding_date".into(), json!(date));
        }
        if let Some(date) = &chamber.dissolution_date {
            record.insert("dissolution_date".into(), json!(date));
        }
        if !chamber.sources.is_empty() {
            let sources = chamber
                .sources
                .iter()
                .map(|url| json!({ "url": url }))
                .collect::<Vec<JsonValue>>();
            record.insert("sources".into(), JsonValue::Array(sources));
        }
        Ok(record)
    }
}

pub fn load_registry(path: impl AsRef<Path>) -> Result<ParliamentRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Polish Sejm as staged from mojepanstwo.pl.
pub fn sejm_pl_profile() -> ParliamentConfig {
    ParliamentConfig {
        code: "PL_SEJM".to_string(),
        display_name: "Sejm Rzeczypospolitej Polskiej".to_string(),
        domain: "mojepanstwo.pl".to_string(),
        endpoint: "pl/sejm".to_string(),
        user: default_user(),
        single_chamber: true,
        chambers: vec![ChamberConfig {
            name: "Sejm".to_string(),
            identifier: "7".to_string(),
            classification: default_classification(),
            founding_date: Some("2011-11-08".to_string()),
            dissolution_date: None,
            sources: vec!["http://www.sejm.gov.pl/".to_string()],
        }],
    }
}

pub fn builtin_profiles() -> Vec<ParliamentConfig> {
    vec![sejm_pl_profile()]
}

/// Finds a profile by code (case-insensitive). Registry entries shadow built-ins.
pub fn profile_for(
    code: &str,
    registry: Option<&ParliamentRegistry>,
) -> Option<Box<dyn ParliamentProfile>> {
    let configured = registry
        .into_iter()
        .flat_map(|r| r.parliaments.iter().cloned())
        .chain(builtin_profiles());
    configured
        .into_iter()
        .find(|p| p.code.eq_ignore_ascii_case(code))
        .map(|p| Box::new(p) as Box<dyn ParliamentProfile>)
}

/// All known profiles, registry entries first, without duplicate codes.
pub fn all_profiles(registry: Option<&ParliamentRegistry>) -> Vec<ParliamentConfig> {
    let mut seen = Vec::<String>::new();
    registry
        .into_iter()
        .flat_map(|r| r.parliaments.iter().cloned())
        .chain(builtin_profiles())
        .filter(|p| {
            let code = p.code.to_uppercase();
            if seen.contains(&code) {
                false
            } else {
                seen.push(code);
                true
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
parliaments:
  - code: SK_NRSR
    display_name: Národná rada Slovenskej republiky
    domain: nrsr.sk
    endpoint: sk/nrsr
    chambers:
      - name: Národná rada
        identifier: "6"
        founding_date: "2012-04-04"
  - code: pl_sejm
    display_name: Sejm (registry)
    domain: sejm.example
    endpoint: pl/sejm
    single_chamber: false
    user: exporter
    chambers: []
"#;

    fn registry() -> ParliamentRegistry {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("parliaments.yaml");
        fs::write(&path, REGISTRY).expect("write registry");
        load_registry(&path).expect("load registry")
    }

    #[test]
    fn registry_defaults_apply() {
        let registry = registry();
        let nrsr = &registry.parliaments[0];
        assert_eq!(nrsr.user, "scraper");
        assert!(nrsr.single_chamber);
        assert_eq!(nrsr.chambers[0].classification, "chamber");
        assert_eq!(nrsr.password_var(), "VPAPI_PWD_SK_NRSR");
    }

    #[test]
    fn chamber_record_is_identified_under_domain_chamber_scheme() {
        let chamber = sejm_pl_profile().chamber(0).unwrap();
        assert_eq!(chamber["name"], json!("Sejm"));
        assert_eq!(chamber["classification"], json!("chamber"));
        assert_eq!(
            chamber["identifiers"],
            json!([{ "scheme": "mojepanstwo.pl/chamber", "identifier": "7" }])
        );
        assert_eq!(chamber["sources"], json!([{ "url": "http://www.sejm.gov.pl/" }]));
        assert!(!chamber.contains_key("dissolution_date"));
    }

    #[test]
    fn missing_chamber_index_is_an_error() {
        let err = sejm_pl_profile().chamber(3).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::NoSuchChamber { index: 3, available: 1, .. }
        ));
    }

    #[test]
    fn registry_entries_shadow_builtins() {
        let registry = registry();
        let sejm = profile_for("PL_SEJM", Some(&registry)).expect("profile");
        assert_eq!(sejm.domain(), "sejm.example");
        assert_eq!(sejm.user(), "exporter");
        assert!(!sejm.single_chamber());

        let builtin = profile_for("pl_sejm", None).expect("builtin");
        assert_eq!(builtin.domain(), "mojepanstwo.pl");
        assert!(profile_for("CZ_PSP", Some(&registry)).is_none());

        let codes = all_profiles(Some(&registry))
            .into_iter()
            .map(|p| p.code)
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["SK_NRSR", "pl_sejm"]);
    }
}
