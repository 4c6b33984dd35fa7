//! CloudStack connection configuration.
//!
//! Credentials are resolved the same way the `cs` CLI does it: environment
//! variables first, then an ini file (`$CLOUDSTACK_CONFIG`,
//! `./cloudstack.ini` or `~/.cloudstack.ini`) with one section per region.

use crate::error::{CloudStackError, CloudStackResult};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default ini section name.
pub const DEFAULT_REGION: &str = "cloudstack";

/// HTTP verb used to send API commands.
///
/// `Post` lifts the ~2KB query-string ceiling to ~32KB, which matters for
/// large user-data payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl FromStr for HttpMethod {
    type Err = CloudStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            other => Err(CloudStackError::config(format!(
                "Unsupported HTTP method '{other}' (expected get or post)"
            ))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Everything needed to talk to a CloudStack management server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackConfig {
    /// API endpoint, e.g. "https://cloud.example.com/client/api"
    pub endpoint: String,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Async job polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound for waiting on a single async job (unbounded when unset)
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,
}

fn default_timeout() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    2
}

impl Default for CloudStackConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            secret_key: String::new(),
            method: HttpMethod::Get,
            timeout_secs: default_timeout(),
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: None,
        }
    }
}

impl CloudStackConfig {
    pub fn new(endpoint: &str, api_key: &str, secret_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Resolve configuration from the process environment, falling back to
    /// the ini file section `region` (or `$CLOUDSTACK_REGION`).
    pub fn load(region: Option<&str>) -> CloudStackResult<Self> {
        if let Some(config) = Self::from_lookup(|k| std::env::var(k).ok())? {
            log::debug!("CloudStack config loaded from environment");
            return Ok(config);
        }

        let region = region
            .map(str::to_string)
            .or_else(|| std::env::var("CLOUDSTACK_REGION").ok())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let path = Self::ini_candidates()
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| {
                CloudStackError::config(
                    "No CloudStack credentials in environment and no cloudstack.ini found",
                )
            })?;

        log::debug!("CloudStack config loaded from {} [{}]", path.display(), region);
        Self::from_ini_file(&path, &region)
    }

    /// Build a config from an environment-style lookup.
    ///
    /// Returns `Ok(None)` when endpoint, key or secret is missing so the
    /// caller can fall through to the ini file.
    pub fn from_lookup<F>(lookup: F) -> CloudStackResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (Some(endpoint), Some(api_key), Some(secret_key)) = (
            lookup("CLOUDSTACK_ENDPOINT"),
            lookup("CLOUDSTACK_KEY"),
            lookup("CLOUDSTACK_SECRET"),
        ) else {
            return Ok(None);
        };

        let mut config = Self::new(&endpoint, &api_key, &secret_key);
        if let Some(method) = lookup("CLOUDSTACK_METHOD") {
            config.method = method.parse()?;
        }
        if let Some(timeout) = lookup("CLOUDSTACK_TIMEOUT") {
            config.timeout_secs = parse_secs("CLOUDSTACK_TIMEOUT", &timeout)?;
        }
        config.validate()?;
        Ok(Some(config))
    }

    /// Read one region section of a cloudstack.ini file.
    pub fn from_ini_file(path: &Path, region: &str) -> CloudStackResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CloudStackError::config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_ini_str(&contents, region)
    }

    pub fn from_ini_str(contents: &str, region: &str) -> CloudStackResult<Self> {
        let section = parse_ini_section(contents, region).ok_or_else(|| {
            CloudStackError::config(format!("Region '{region}' not found in config file"))
        })?;

        let get = |key: &str| -> CloudStackResult<String> {
            section.get(key).cloned().ok_or_else(|| {
                CloudStackError::config(format!("Missing '{key}' in region '{region}'"))
            })
        };

        let mut config = Self::new(&get("endpoint")?, &get("key")?, &get("secret")?);
        if let Some(method) = section.get("method") {
            config.method = method.parse()?;
        }
        if let Some(timeout) = section.get("timeout") {
            config.timeout_secs = parse_secs("timeout", timeout)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that cannot possibly produce a signed request.
    pub fn validate(&self) -> CloudStackResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(CloudStackError::config("endpoint is empty"));
        }
        let url = url::Url::parse(&self.endpoint).map_err(|e| {
            CloudStackError::config(format!("Invalid endpoint '{}': {e}", self.endpoint))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CloudStackError::config(format!(
                "Endpoint scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.api_key.is_empty() {
            return Err(CloudStackError::config("api key is empty"));
        }
        if self.secret_key.is_empty() {
            return Err(CloudStackError::config("secret key is empty"));
        }
        if self.poll_interval_secs == 0 {
            return Err(CloudStackError::config("poll interval must be at least 1s"));
        }
        Ok(())
    }

    fn ini_candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(p) = std::env::var("CLOUDSTACK_CONFIG") {
            paths.push(PathBuf::from(p));
        }
        paths.push(PathBuf::from("cloudstack.ini"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".cloudstack.ini"));
        }
        paths
    }
}

fn parse_secs(key: &str, value: &str) -> CloudStackResult<u64> {
    value.trim().parse().map_err(|_| {
        CloudStackError::config(format!("'{key}' must be a number of seconds, got '{value}'"))
    })
}

/// Minimal ini reader: `[section]` headers, `key = value` pairs, `#`/`;` comments.
fn parse_ini_section(contents: &str, section: &str) -> Option<HashMap<String, String>> {
    let mut current: Option<&str> = None;
    let mut found = false;
    let mut values = HashMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim());
            found |= current == Some(section);
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            values.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    found.then_some(values)
}
