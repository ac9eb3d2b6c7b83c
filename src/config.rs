//! Configuration Management
//!
//! Resolves the provider configuration from, in order of precedence: the provider block,
//! the `SCW_*` environment, the active profile of `~/.config/scw/config.yaml`, and the
//! default profile of that file.

use crate::locality::{Region, Zone};
use crate::provider::meta::Meta;
use crate::reconcile::wait::set_configured_interval;
use crate::scw::auth::{is_uuid, validate_access_key, Credentials};
use crate::scw::client::ScwClient;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ACCESS_KEY: &str = "SCW_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "SCW_SECRET_KEY";
pub const ENV_PROJECT_ID: &str = "SCW_DEFAULT_PROJECT_ID";
pub const ENV_ORGANIZATION_ID: &str = "SCW_DEFAULT_ORGANIZATION_ID";
pub const ENV_REGION: &str = "SCW_DEFAULT_REGION";
pub const ENV_ZONE: &str = "SCW_DEFAULT_ZONE";
pub const ENV_API_URL: &str = "SCW_API_URL";
pub const ENV_PROFILE: &str = "SCW_PROFILE";
pub const ENV_CONFIG_PATH: &str = "SCW_CONFIG_PATH";

/// Settings shared by the provider block, a profile and the environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(alias = "default_project_id")]
    pub project_id: Option<String>,
    #[serde(alias = "default_organization_id")]
    pub organization_id: Option<String>,
    #[serde(alias = "default_region")]
    pub region: Option<String>,
    #[serde(alias = "default_zone")]
    pub zone: Option<String>,
    pub api_url: Option<String>,
}

impl Profile {
    /// Fill every unset field from `lower`
    fn or(self, lower: Profile) -> Profile {
        Profile {
            access_key: self.access_key.or(lower.access_key),
            secret_key: self.secret_key.or(lower.secret_key),
            project_id: self.project_id.or(lower.project_id),
            organization_id: self.organization_id.or(lower.organization_id),
            region: self.region.or(lower.region),
            zone: self.zone.or(lower.zone),
            api_url: self.api_url.or(lower.api_url),
        }
    }

    fn from_env(env: &dyn Fn(&str) -> Option<String>) -> Profile {
        let var = |name: &str| env(name).filter(|v| !v.is_empty());
        Profile {
            access_key: var(ENV_ACCESS_KEY),
            secret_key: var(ENV_SECRET_KEY),
            project_id: var(ENV_PROJECT_ID),
            organization_id: var(ENV_ORGANIZATION_ID),
            region: var(ENV_REGION),
            zone: var(ENV_ZONE),
            api_url: var(ENV_API_URL),
        }
    }
}

/// The `scw` CLI configuration file: a default profile plus named ones
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub default: Profile,
    pub active_profile: Option<String>,
    pub profiles: HashMap<String, Profile>,
}

impl ConfigFile {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("scw").join("config.yaml"))
    }

    /// Load a configuration file; a missing file is an empty configuration
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no configuration file at {:?}", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))
    }

    /// The selected named profile over the default one
    pub fn profile(&self, name: Option<&str>) -> Result<Profile> {
        let Some(name) = name.or(self.active_profile.as_deref()) else {
            return Ok(self.default.clone());
        };
        match self.profiles.get(name) {
            Some(profile) => Ok(profile.clone().or(self.default.clone())),
            None => bail!("profile {:?} not found in configuration file", name),
        }
    }
}

/// Provider block as written by the user
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub settings: Profile,
    pub profile: Option<String>,
    /// Poll interval of every wait, e.g. `"10s"`
    pub wait_interval: Option<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub credentials: Option<Credentials>,
    pub project_id: Option<String>,
    pub organization_id: Option<String>,
    pub region: Option<Region>,
    pub zone: Option<Zone>,
    pub api_url: Option<String>,
    pub wait_interval: Option<Duration>,
}

impl ProviderConfig {
    /// Load a provider block from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read provider configuration {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse provider configuration {}", path.display()))
    }

    /// Resolve against the process environment and the configuration file
    pub fn resolve(self) -> Result<ResolvedConfig> {
        let env = |name: &str| std::env::var(name).ok();
        let path = env(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .or_else(ConfigFile::default_path);
        let file = match path {
            Some(path) => ConfigFile::load(&path)?,
            None => ConfigFile::default(),
        };
        self.resolve_with(&env, &file)
    }

    pub fn resolve_with(
        self,
        env: &dyn Fn(&str) -> Option<String>,
        file: &ConfigFile,
    ) -> Result<ResolvedConfig> {
        let profile_name = self.profile.clone().or_else(|| env(ENV_PROFILE));
        let merged = self
            .settings
            .or(Profile::from_env(env))
            .or(file.profile(profile_name.as_deref())?);

        let credentials = match (&merged.access_key, &merged.secret_key) {
            (Some(access), Some(secret)) => {
                if !validate_access_key(access) {
                    bail!("invalid access key format, expected SCWXXXXXXXXXXXXXXXXX");
                }
                if !is_uuid(secret) {
                    bail!("invalid secret key format, expected a UUID");
                }
                Some(Credentials::new(access, secret)?)
            }
            (None, Some(_)) => bail!("a secret key is set without an access key"),
            (Some(_), None) => bail!("an access key is set without a secret key"),
            (None, None) => None,
        };

        for (what, value) in [
            ("project_id", &merged.project_id),
            ("organization_id", &merged.organization_id),
        ] {
            if let Some(value) = value {
                if !is_uuid(value) {
                    bail!("invalid {} {:?}, expected a UUID", what, value);
                }
            }
        }

        let region = merged
            .region
            .as_deref()
            .map(str::parse::<Region>)
            .transpose()
            .context("invalid region")?;
        let zone = merged
            .zone
            .as_deref()
            .map(str::parse::<Zone>)
            .transpose()
            .context("invalid zone")?;
        if let (Some(region), Some(zone)) = (region, zone) {
            if !region.contains(zone) {
                tracing::warn!("default zone {} is outside default region {}", zone, region);
            }
        }

        let wait_interval = self
            .wait_interval
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("invalid wait_interval")?;

        Ok(ResolvedConfig {
            credentials,
            project_id: merged.project_id,
            organization_id: merged.organization_id,
            region,
            zone,
            api_url: merged.api_url,
            wait_interval,
        })
    }
}

impl ResolvedConfig {
    /// Build the provider meta; applies the configured wait interval process-wide
    pub fn into_meta(self) -> Result<Meta> {
        if let Some(interval) = self.wait_interval {
            set_configured_interval(interval);
        }
        let client = ScwClient::new(self.credentials, self.api_url.as_deref())
            .context("cannot build the Scaleway client")?;
        Ok(Meta::new(client).with_defaults(
            self.region,
            self.zone,
            self.project_id,
            self.organization_id,
        ))
    }
}
