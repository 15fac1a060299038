use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::matcher::DEFAULT_IMPLICIT_EXCLUSION;
use crate::models::{parse_distance_groups, DistanceGroup};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,

    pub telegram: TelegramConfig,

    pub pricing: PricingConfig,

    pub geofence: GeofenceConfig,

    pub matcher: MatcherConfig,

    pub scrape: ScrapeConfig,

    pub geocoder: GeocoderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; the platform data directory is used when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_base: String,

    pub bot_token: String,

    /// Bot used for priority messages (cross-source or geofence hits).
    pub priority_bot_token: String,

    /// Default destination when a search has no chat override.
    pub chat_id: String,

    /// Destination for priority messages; falls back to the resolved chat.
    pub priority_chat_id: Option<String>,

    /// Prefix for every message, e.g. an emoji marking this instance.
    pub source_indicator: String,

    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: String::new(),
            priority_bot_token: String::new(),
            chat_id: String::new(),
            priority_chat_id: None,
            source_indicator: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Expected resale benefit in TARGET mode (0.2 = 20%).
    pub target_benefit: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            target_benefit: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Global fallback, `dist,zip,zip-dist,zip`. Empty disables it.
    pub location_filter: String,

    /// Check distance for shipped listings too and route hits to the priority chat.
    pub force_priority: bool,

    /// Abort the whole run when a geocode lookup fails instead of skipping the listing.
    pub fail_fast: bool,
}

impl GeofenceConfig {
    pub fn fallback_groups(&self) -> Result<Vec<DistanceGroup>> {
        parse_distance_groups(&self.location_filter).context("Invalid geofence.location_filter")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub implicit_exclusions: Vec<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            implicit_exclusions: vec![DEFAULT_IMPLICIT_EXCLUSION.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub klein_base_url: String,

    pub ebay_base_url: String,

    /// Upper bound of the random pause between result pages.
    pub page_delay_max_ms: u64,

    pub timeout_secs: u64,
}

impl ScrapeConfig {
    pub fn ebay_item_url(&self, post_id: &str) -> String {
        format!("{}/itm/{}", self.ebay_base_url.trim_end_matches('/'), post_id)
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            klein_base_url: "https://www.kleinanzeigen.de".to_string(),
            ebay_base_url: "https://www.ebay.de".to_string(),
            page_delay_max_ms: 2000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,

    pub user_agent: String,

    pub country_codes: Option<String>,

    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "kleinalert/0.1".to_string(),
            country_codes: Some("de".to_string()),
            timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        // .env is optional
        let _ = dotenvy::dotenv();

        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => match Self::config_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::load_from_path(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("kleinalert.toml")];
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "kleinalert") {
            paths.push(proj_dirs.config_dir().join("config.toml"));
        }
        paths
    }

    fn apply_env(&mut self) {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(token) = var("BOTTOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(token) = var("BOTTOKEN_PRIO") {
            self.telegram.priority_bot_token = token;
        }
        if let Some(chat) = var("CHAT_ID") {
            self.telegram.chat_id = chat;
        }
        if let Some(chat) = var("CHAT_ID_PRIO") {
            self.telegram.priority_chat_id = Some(chat);
        }
        if let Some(path) = var("KLEINALERT_DB") {
            self.database.path = Some(PathBuf::from(path));
        }
    }
}
