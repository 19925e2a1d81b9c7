use anyhow::Context;
use serde::Deserialize;
use std::{env, fs, path::PathBuf};
use time::{
    macros::format_description, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub access_id: Option<String>,
    pub access_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ApiConfig {
    pub fn credentials(&self) -> anyhow::Result<(&str, &str)> {
        match (self.access_id.as_deref(), self.access_key.as_deref()) {
            (Some(id), Some(key)) => Ok((id, key)),
            _ => anyhow::bail!(
                "missing credentials: set ACCESS_ID and ACCESS_KEY (env or [api] section)"
            ),
        }
    }
}

/// Parameters for one backfill run. `start` and `end` are local wall-clock
/// instants in `day/month/year hour:minute` form, interpreted in `utc_offset`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub start: String,
    pub end: String,
    pub utc_offset: String,
    pub device_id: Option<String>,
    pub description: String,
    pub output_path: PathBuf,
    #[serde(default)]
    pub dedup: bool,
}

impl RunConfig {
    pub fn device_id(&self) -> anyhow::Result<&str> {
        self.device_id
            .as_deref()
            .context("missing device id: set DEVICE_ID (env or [run] section)")
    }

    /// Resolves the configured window to UTC instants and checks ordering.
    pub fn window(&self) -> anyhow::Result<(OffsetDateTime, OffsetDateTime)> {
        let offset = parse_utc_offset(&self.utc_offset)?;
        let start = parse_instant(&self.start, offset)
            .with_context(|| format!("invalid [run] start '{}'", self.start))?;
        let end = parse_instant(&self.end, offset)
            .with_context(|| format!("invalid [run] end '{}'", self.end))?;
        if start > end {
            anyhow::bail!("[run] start '{}' is after end '{}'", self.start, self.end);
        }
        Ok((start, end))
    }
}

fn parse_utc_offset(s: &str) -> anyhow::Result<UtcOffset> {
    let fmt = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(s.trim(), &fmt)
        .with_context(|| format!("invalid [run] utc_offset '{s}' (expected +HH:MM or -HH:MM)"))
}

fn parse_instant(s: &str, offset: UtcOffset) -> anyhow::Result<OffsetDateTime> {
    let fmt = format_description!("[day]/[month]/[year] [hour]:[minute]:[second]");
    // Input is minute resolution; fix seconds to :00 before parsing.
    let normalized = format!("{}:00", s.trim());
    let dt = PrimitiveDateTime::parse(&normalized, &fmt)
        .context("expected day/month/year hour:minute")?;
    Ok(dt.assume_offset(offset))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub run: RunConfig,
}

impl AppConfig {
    pub fn load(path_override: Option<&str>) -> anyhow::Result<Self> {
        let path = path_override
            .map(str::to_string)
            .or_else(|| env::var("COLLECTOR_CONFIG").ok())
            .unwrap_or_else(|| "collector-config.toml".to_string());
        let contents =
            fs::read_to_string(&path).with_context(|| format!("failed to read config '{path}'"))?;
        let mut cfg: AppConfig = toml::from_str(&contents)?;
        cfg.apply_env_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("API_ENDPOINT") {
            self.api.endpoint = v;
        }
        if let Some(v) = lookup("ACCESS_ID") {
            self.api.access_id = Some(v);
        }
        if let Some(v) = lookup("ACCESS_KEY") {
            self.api.access_key = Some(v);
        }
        if let Some(v) = lookup("DEVICE_ID") {
            self.run.device_id = Some(v);
        }
    }
}
