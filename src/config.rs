use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

use crate::{DatumError, Result};

pub const SECRET_ENV_PREFIX: &str = "DATUM_SECRET_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: String,
    pub log_level: LogLevel,
    pub chunk_size: usize,
    pub from_srid: Option<i32>,
    pub to_srid: Option<i32>,
    pub secret_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: String::new(),
            log_level: LogLevel::Info,
            chunk_size: 1_000,
            from_srid: None,
            to_srid: None,
            secret_id: None,
        }
    }
}

impl Config {
    /// The connection URL to open, with the secret (if any) injected as its
    /// password.
    pub fn connection_url(&self) -> Result<String> {
        process_connection_string(&self.connection, self.secret_id.as_deref())
    }
}

// YAML config file structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlConfig {
    pub version: u32,
    pub connection: String,
    pub options: Option<OptionsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptionsConfig {
    pub chunk_size: Option<usize>,
    pub log_level: Option<LogLevel>,
    pub from_srid: Option<i32>,
    pub to_srid: Option<i32>,
}

impl YamlConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn into_config(self) -> Result<Config> {
        let connection = substitute_env_vars(&self.connection)?;
        let options = self.options.unwrap_or_default();
        let defaults = Config::default();

        Ok(Config {
            connection,
            log_level: options.log_level.unwrap_or(defaults.log_level),
            chunk_size: options.chunk_size.unwrap_or(defaults.chunk_size),
            from_srid: options.from_srid,
            to_srid: options.to_srid,
            secret_id: None, // env vars are substituted directly
        })
    }
}

/// Substitute environment variable patterns like ${VAR_NAME} in strings
fn substitute_env_vars(input: &str) -> Result<String> {
    let env_var_pattern = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| DatumError::Configuration(e.to_string()))?;
    let mut result = input.to_string();

    for caps in env_var_pattern.captures_iter(input) {
        if let Some(var_name) = caps.get(1) {
            let var_name = var_name.as_str();
            let value = env::var(var_name).map_err(|_| {
                DatumError::Configuration(format!("Environment variable '{}' not found", var_name))
            })?;
            result = result.replace(&format!("${{{}}}", var_name), &value);
        }
    }

    Ok(result)
}

/// Logs a warning when the URL carries its password in clear text.
pub fn check_and_warn_about_password_in_url(url: &str) {
    if let Ok(parsed) = Url::parse(url) {
        if !parsed.password().unwrap_or("").is_empty() {
            warn!("Using a password in the connection URL is insecure. Consider --secret-id.");
        }
    }
}

/// Looks up `DATUM_SECRET_<id>`.
pub fn resolve_secret(secret_id: &str) -> Result<String> {
    let var = format!("{}{}", SECRET_ENV_PREFIX, secret_id);
    match env::var(&var) {
        Ok(value) => {
            info!("Resolved secret for ID: {}", secret_id);
            Ok(value)
        }
        Err(_) => Err(DatumError::Configuration(format!(
            "Secret not found: environment variable {} is not set",
            var
        ))),
    }
}

/// Returns `url` with the password taken from the secret `secret_id`, or
/// unchanged when no secret is given.
pub fn process_connection_string(url: &str, secret_id: Option<&str>) -> Result<String> {
    check_and_warn_about_password_in_url(url);

    let Some(secret_id) = secret_id else {
        return Ok(url.to_string());
    };
    let secret = resolve_secret(secret_id)?;

    let mut parsed = Url::parse(url)?;
    if !parsed.password().unwrap_or("").is_empty() {
        warn!("Overriding password in connection URL with secret {}", secret_id);
    }
    parsed.set_password(Some(&secret)).map_err(|_| {
        DatumError::Configuration(format!("Cannot set a password on {}", parsed.scheme()))
    })?;
    Ok(parsed.to_string())
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err("Invalid log level. Valid values: debug, info, warn, error"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
