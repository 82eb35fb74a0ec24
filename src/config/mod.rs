use crate::portal::Credentials;
use crate::transform::{AggregationRules, SeriesTransform};
use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

pub const APP_NAME: &str = "radiant-net";
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// `RADIANT__SECRETS__USERNAME` → `secrets.username`
pub const ENV_PREFIX: &str = "RADIANT__";

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub portal: PortalConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    pub storage: StorageConfig,
    pub paths: PathsConfig,
    pub transform: TransformConfig,
    pub schedule: ScheduleConfig,
}

/// Portal endpoints and HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    pub landing_url: String,
    pub login_url: String,
    pub auth_url: String,
    pub chart_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Login credentials. Usually only set in the user file or the environment.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct SecretsConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub system_id: Option<String>,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("system_id", &self.system_id)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    pub raw_data_dir: PathBuf,
}

/// Calendar and aggregation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformConfig {
    /// IANA zone used to derive year/month/day/hour/minute from timestamps.
    pub timezone: String,
    /// Metrics matching this pattern are integrated to kWh.
    pub kwh_column_pattern: String,
    /// Metrics averaged per day; never summed.
    pub mean_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub interval_hours: u64,
    pub days_ago: u32,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    10
}
fn default_user_agent() -> String {
    format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION"))
}

// ── Layers ───────────────────────────────────────────────────────────────────

/// One configuration source. Later layers override earlier ones.
#[derive(Debug, Clone)]
pub enum ConfigLayer {
    /// TOML document held in memory.
    Toml(String),
    /// Optional TOML file; skipped when absent.
    File(PathBuf),
    /// Environment variables; only those starting with [`ENV_PREFIX`] are used.
    Env(HashMap<String, String>),
}

/// Merge layers in increasing priority into one configuration.
pub fn merge(layers: Vec<ConfigLayer>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    for layer in layers {
        builder = match layer {
            ConfigLayer::Toml(text) => {
                builder.add_source(config::File::from_str(&text, config::FileFormat::Toml))
            }
            ConfigLayer::File(path) => builder.add_source(
                config::File::from(path)
                    .required(false)
                    .format(config::FileFormat::Toml),
            ),
            ConfigLayer::Env(vars) => {
                let mut builder = builder;
                for (key, value) in env_overrides(&vars) {
                    builder = builder
                        .set_override(key.as_str(), value)
                        .with_context(|| format!("Bad environment override {}", key))?;
                }
                builder
            }
        };
    }

    builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Configuration is incomplete or malformed")
}

/// `RADIANT__STORAGE__DB_PATH=x` → (`storage.db_path`, `x`)
fn env_overrides(vars: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut overrides: Vec<(String, String)> = vars
        .iter()
        .filter_map(|(name, value)| {
            let path = name.strip_prefix(ENV_PREFIX)?;
            if path.is_empty() || value.is_empty() {
                return None;
            }
            Some((path.to_lowercase().replace("__", "."), value.clone()))
        })
        .collect();
    overrides.sort();
    overrides
}

// ── Paths ────────────────────────────────────────────────────────────────────

/// Where the app looks for things.
#[derive(Debug, Clone, Serialize)]
pub struct AppPaths {
    pub site_config: PathBuf,
    pub user_config: Option<PathBuf>,
    pub raw_data: PathBuf,
    pub data: PathBuf,
}

pub fn site_config_path() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME).join(CONFIG_FILE_NAME)
}

pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join(APP_NAME).join(CONFIG_FILE_NAME))
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Defaults < site file < user file < environment (including `.env`).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut layers = vec![
            ConfigLayer::Toml(DEFAULT_CONFIG.to_string()),
            ConfigLayer::File(site_config_path()),
        ];
        if let Some(user) = user_config_path() {
            layers.push(ConfigLayer::File(user));
        }
        layers.push(ConfigLayer::Env(std::env::vars().collect()));

        merge(layers)
    }

    pub fn paths(&self) -> AppPaths {
        AppPaths {
            site_config: site_config_path(),
            user_config: user_config_path(),
            raw_data: self.paths.raw_data_dir.clone(),
            data: self.storage.db_path.clone(),
        }
    }

    /// Portal credentials; fails naming every secret that is not set.
    pub fn credentials(&self) -> Result<Credentials> {
        let s = &self.secrets;
        let missing: Vec<&str> = [
            ("username", &s.username),
            ("password", &s.password),
            ("system_id", &s.system_id),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().map(str::is_empty).unwrap_or(true))
        .map(|(k, _)| k)
        .collect();

        if !missing.is_empty() {
            let user = user_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<no home directory>".into());
            bail!(
                "Secrets {} are not set. Set them in the environment ({}SECRETS__<NAME>), \
                 the machine-wide config at {}, or your personal config at {}.",
                missing.join(", "),
                ENV_PREFIX,
                site_config_path().display(),
                user
            );
        }

        Ok(Credentials {
            username: s.username.clone().unwrap_or_default(),
            password: s.password.clone().unwrap_or_default(),
            system_id: s.system_id.clone().unwrap_or_default(),
        })
    }

    pub fn series_transform(&self) -> Result<SeriesTransform> {
        let t = &self.transform;
        let tz: Tz = t
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid timezone {:?}: {}", t.timezone, e))?;
        let rules = AggregationRules::new(&t.kwh_column_pattern, t.mean_columns.clone())
            .with_context(|| format!("Invalid kWh column pattern {:?}", t.kwh_column_pattern))?;
        Ok(SeriesTransform::new(tz, rules))
    }
}

/// The embedded `config/default.toml` on its own.
#[cfg(test)]
impl Default for AppConfig {
    fn default() -> Self {
        merge(vec![ConfigLayer::Toml(DEFAULT_CONFIG.to_string())])
            .expect("embedded default config is complete")
    }
}
