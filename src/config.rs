//! Configuration loader and validator for the devotional content pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub generator: Generator,
    pub admin: Admin,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

/// Generative backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generator {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub video_model: String,
    /// Model used to edit an uploaded image.
    #[serde(default = "default_edit_model")]
    pub edit_model: String,
    /// Model used for free-form text analysis.
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,
    #[serde(default = "default_video_poll_interval_ms")]
    pub video_poll_interval_ms: u64,
}

/// Master admin account seeded on startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Admin {
    pub email: String,
    pub password: String,
}

fn default_session_ttl_hours() -> u64 {
    24
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/".to_string()
}

fn default_edit_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_analysis_model() -> String {
    "gemini-3-pro-preview".to_string()
}

fn default_video_poll_interval_ms() -> u64 {
    10_000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL for the store, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/devotional.db", self.app.resolved_data_dir())
        })
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.session_ttl_hours == 0 {
        return Err(ConfigError::Invalid("app.session_ttl_hours must be > 0"));
    }

    let g = &cfg.generator;
    if g.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.api_key must be non-empty"));
    }
    if reqwest::Url::parse(&g.base_url).is_err() {
        return Err(ConfigError::Invalid("generator.base_url must be a valid URL"));
    }
    if g.text_model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.text_model must be non-empty"));
    }
    if g.image_model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.image_model must be non-empty"));
    }
    if g.video_model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.video_model must be non-empty"));
    }
    if g.edit_model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.edit_model must be non-empty"));
    }
    if g.analysis_model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.analysis_model must be non-empty"));
    }
    if g.video_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("generator.video_poll_interval_ms must be > 0"));
    }

    if !cfg.admin.email.contains('@') {
        return Err(ConfigError::Invalid("admin.email must be an email address"));
    }
    if cfg.admin.password.len() < 8 {
        return Err(ConfigError::Invalid("admin.password must be at least 8 characters"));
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  session_ttl_hours: 24

generator:
  api_key: "YOUR_GEMINI_API_KEY"
  base_url: "https://generativelanguage.googleapis.com/"
  text_model: "gemini-3-flash-preview"
  image_model: "gemini-3-pro-image-preview"
  video_model: "veo-3.1-fast-generate-preview"
  edit_model: "gemini-2.5-flash-image"
  analysis_model: "gemini-3-pro-preview"
  video_poll_interval_ms: 10000

admin:
  email: "admin@devotional.ai"
  password: "CHANGE_ME_BEFORE_DEPLOY"
"#
}
