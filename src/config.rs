use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_REGISTRY_BASE_URL: &str = "https://recherche-entreprises.api.gouv.fr";
pub const DEFAULT_RGE_BASE_URL: &str =
    "https://data.ademe.fr/data-fair/api/v1/datasets/liste-des-entreprises-rge-2";
pub const DEFAULT_BODACC_BASE_URL: &str = "https://bodacc-datadila.opendatasoft.com/api/explore/v2.0";
pub const DEFAULT_API_ENTREPRISE_BASE_URL: &str = "https://entreprise.api.gouv.fr";
pub const DEFAULT_PAPPERS_BASE_URL: &str = "https://api.pappers.fr/v2";
pub const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Time-to-live and batch settings of the company cache.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RefreshPolicy {
    /// TTL when the quality score is at least 70.
    pub ttl_high_days: i64,
    /// TTL when the quality score is at least 40.
    pub ttl_medium_days: i64,
    pub ttl_low_days: i64,
    /// Pause between two records of a refresh batch.
    pub batch_delay_ms: u64,
    pub max_companies: usize,
    /// Reads above which a record counts as high-traffic.
    pub high_traffic_min_fetches: i64,
    pub high_traffic_age_days: i64,
    /// TTL of the in-process hot layer.
    pub hot_cache_ttl_secs: u64,
    /// Live fetches scoring below this are retried on the premium registry.
    pub premium_upgrade_below: u8,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            ttl_high_days: 90,
            ttl_medium_days: 30,
            ttl_low_days: 7,
            batch_delay_ms: 500,
            max_companies: 50,
            high_traffic_min_fetches: 10,
            high_traffic_age_days: 30,
            hot_cache_ttl_secs: 300,
            premium_upgrade_below: 60,
        }
    }
}

impl RefreshPolicy {
    /// Better-documented companies are refreshed less often.
    pub fn ttl_for(&self, quality_score: u8) -> ChronoDuration {
        let days = if quality_score >= 70 {
            self.ttl_high_days
        } else if quality_score >= 40 {
            self.ttl_medium_days
        } else {
            self.ttl_low_days
        };
        ChronoDuration::days(days)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Optional: the in-memory store is used when absent.
    pub database_url: Option<String>,
    pub port: u16,
    pub claude_api_key: Option<String>,
    pub claude_model: String,
    pub claude_base_url: String,
    pub api_entreprise_token: Option<String>,
    pub api_entreprise_base_url: String,
    /// Optional: enables the premium registry upgrade.
    pub pappers_api_key: Option<String>,
    pub pappers_base_url: String,
    pub knowledge_search_url: Option<String>,
    pub registry_base_url: String,
    pub rge_base_url: String,
    pub bodacc_base_url: String,
    pub provider_timeout_ms: u64,
    /// Share of the externally supplied score in the entreprise score blend.
    pub ai_score_weight: f64,
    pub reference_tables_path: Option<String>,
    pub refresh: RefreshPolicy,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn url_var(name: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(name).unwrap_or_else(|_| default.to_string());
    if url.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = RefreshPolicy::default();

        let config = Self {
            database_url: optional_var("DATABASE_URL")
                .or_else(|| optional_var("DB_URL"))
                .map(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })
                .transpose()?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            claude_api_key: optional_var("CLAUDE_API_KEY"),
            claude_model: optional_var("CLAUDE_MODEL")
                .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
            claude_base_url: url_var("CLAUDE_BASE_URL", DEFAULT_CLAUDE_BASE_URL)?,
            api_entreprise_token: optional_var("API_ENTREPRISE_TOKEN"),
            api_entreprise_base_url: url_var(
                "API_ENTREPRISE_BASE_URL",
                DEFAULT_API_ENTREPRISE_BASE_URL,
            )?,
            pappers_api_key: optional_var("PAPPERS_API_KEY"),
            pappers_base_url: url_var("PAPPERS_BASE_URL", DEFAULT_PAPPERS_BASE_URL)?,
            knowledge_search_url: match optional_var("KNOWLEDGE_SEARCH_URL") {
                Some(_) => Some(url_var("KNOWLEDGE_SEARCH_URL", "")?),
                None => None,
            },
            registry_base_url: url_var("REGISTRY_BASE_URL", DEFAULT_REGISTRY_BASE_URL)?,
            rge_base_url: url_var("RGE_BASE_URL", DEFAULT_RGE_BASE_URL)?,
            bodacc_base_url: url_var("BODACC_BASE_URL", DEFAULT_BODACC_BASE_URL)?,
            provider_timeout_ms: parsed_var("PROVIDER_TIMEOUT_MS", 8_000u64).and_then(|ms| {
                if ms == 0 {
                    anyhow::bail!("PROVIDER_TIMEOUT_MS must be greater than 0");
                }
                Ok(ms)
            })?,
            ai_score_weight: parsed_var("AI_SCORE_WEIGHT", 0.4f64).and_then(|w| {
                if !(0.0..=1.0).contains(&w) {
                    anyhow::bail!("AI_SCORE_WEIGHT must be between 0 and 1");
                }
                Ok(w)
            })?,
            reference_tables_path: optional_var("REFERENCE_TABLES_PATH"),
            refresh: RefreshPolicy {
                batch_delay_ms: parsed_var("REFRESH_BATCH_DELAY_MS", defaults.batch_delay_ms)?,
                max_companies: parsed_var("REFRESH_MAX_COMPANIES", defaults.max_companies)?,
                ttl_high_days: parsed_var("CACHE_TTL_HIGH_DAYS", defaults.ttl_high_days)?,
                ttl_medium_days: parsed_var("CACHE_TTL_MEDIUM_DAYS", defaults.ttl_medium_days)?,
                ttl_low_days: parsed_var("CACHE_TTL_LOW_DAYS", defaults.ttl_low_days)?,
                premium_upgrade_below: parsed_var(
                    "PREMIUM_UPGRADE_BELOW_SCORE",
                    defaults.premium_upgrade_below,
                )?,
                ..defaults
            },
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        match config.database_url {
            Some(ref url) => tracing::debug!("Database URL: {}...", &url[..20.min(url.len())]),
            None => tracing::warn!("DATABASE_URL not set, company cache is in-memory only"),
        }
        tracing::debug!("Registry Base URL: {}", config.registry_base_url);
        if config.claude_api_key.is_none() {
            tracing::info!("CLAUDE_API_KEY not set, generative extraction disabled");
        }
        if config.api_entreprise_token.is_none() {
            tracing::info!("API_ENTREPRISE_TOKEN not set, attestation provider disabled");
        }
        if config.pappers_api_key.is_none() {
            tracing::info!("PAPPERS_API_KEY not set, premium registry upgrade disabled");
        }
        tracing::debug!("Provider timeout: {} ms", config.provider_timeout_ms);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}
