use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use crate::db::Database;
use crate::error::ConfigError;
use crate::prefilter::FilterConfig;

pub const DEFAULT_CONFIG_FILE: &str = "dealscout.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub filter: FilterConfig,
    pub seek: SeekConfig,
    pub mock: MockConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to the platform data directory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Installs the global subscriber. Logs go to stderr so command output stays on stdout.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
            _ => {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeekConfig {
    pub base_url: String,
    pub location: String,
    pub radius_km: u32,
    pub fetch_details: bool,
    pub max_retries: u32,
    /// Upper bound of the random pause before each detail page request.
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SeekConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.seekbusiness.com.au".into(),
            location: "sunshine-coast-qld".into(),
            radius_km: 50,
            fetch_details: true,
            max_retries: 3,
            request_delay_ms: 3_000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub seed: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl Settings {
    /// Reads `.env`, then the TOML file (if any), then environment overrides.
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        if let Ok(db_path) = std::env::var("DEALSCOUT_DB") {
            settings.database.path = Some(PathBuf::from(db_path));
        }
        if let Ok(level) = std::env::var("DEALSCOUT_LOG") {
            settings.logging.level = level;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content).map_err(ConfigError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(Database::default_path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(margin) = self.filter.min_ebitda_margin {
            if !(0.0..=1.0).contains(&margin) {
                return Err(ConfigError::InvalidValue {
                    field: "filter.min_ebitda_margin",
                    reason: format!("{} is not a fraction between 0 and 1", margin),
                });
            }
        }
        if self.seek.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "seek.max_retries",
                reason: "must be at least 1".into(),
            });
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format",
                reason: format!("'{}' (expected pretty or json)", self.logging.format),
            });
        }
        Ok(())
    }
}
