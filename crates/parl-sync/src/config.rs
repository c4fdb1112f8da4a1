use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parl_adapters::{load_registry, profile_for, ParliamentProfile, ParliamentRegistry};
use parl_storage::{HttpStore, HttpStoreConfig, StagedReader, TokenBucketConfig};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the staged files; each parliament reads `<output_path>/<domain>/`.
    pub output_path: PathBuf,
    pub server_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub registry_path: PathBuf,
    /// Overrides the profile's endpoint when set.
    pub parliament_endpoint: Option<String>,
    pub max_requests_per_sec: Option<u32>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            output_path: var("PARL_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            server_url: var("PARL_SERVER_URL")
                .unwrap_or_else(|| "http://localhost:5000".to_string()),
            http_timeout_secs: var("PARL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            user_agent: var("PARL_USER_AGENT").unwrap_or_else(|| "parl-sync/0.1".to_string()),
            registry_path: var("PARL_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("parliaments.yaml")),
            parliament_endpoint: var("PARL_PARLIAMENT_ENDPOINT").filter(|v| !v.trim().is_empty()),
            max_requests_per_sec: var("PARL_MAX_REQUESTS_PER_SEC")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
        }
    }

    /// The registry file, or `None` when it does not exist.
    pub fn load_registry(&self) -> Result<Option<ParliamentRegistry>> {
        if !self.registry_path.exists() {
            return Ok(None);
        }
        load_registry(&self.registry_path).map(Some)
    }

    pub fn profile(&self, code: &str) -> Result<Box<dyn ParliamentProfile>> {
        let registry = self.load_registry()?;
        profile_for(code, registry.as_ref())
            .ok_or_else(|| anyhow!("unknown parliament `{code}`"))
    }

    pub fn endpoint_for(&self, profile: &dyn ParliamentProfile) -> String {
        self.parliament_endpoint
            .clone()
            .unwrap_or_else(|| profile.endpoint().to_string())
    }

    pub fn staged_reader(&self, profile: &dyn ParliamentProfile) -> StagedReader {
        StagedReader::new(&self.output_path, profile.domain())
    }

    pub fn store_config(&self, profile: &dyn ParliamentProfile, password: &str) -> HttpStoreConfig {
        let base_url = format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.endpoint_for(profile).trim_matches('/')
        );
        let mut config = HttpStoreConfig::new(base_url);
        config.user = Some(profile.user().to_string());
        config.password = Some(password.to_string());
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        config.token_bucket = self.max_requests_per_sec.map(|rate| TokenBucketConfig {
            capacity: rate,
            refill_every: Duration::from_nanos(1_000_000_000 / u64::from(rate)),
        });
        config
    }

    pub fn http_store(&self, profile: &dyn ParliamentProfile) -> Result<HttpStore> {
        let password = password_from_env(profile)?;
        HttpStore::new(self.store_config(profile, &password))
            .with_context(|| format!("creating store client for {}", profile.code()))
    }
}

pub fn password_from_env(profile: &dyn ParliamentProfile) -> Result<String> {
    let var = profile.password_var();
    std::env::var(&var).with_context(|| format!("{var} is not set"))
}
