//! Layered configuration for a load run.
//!
//! Settings are resolved from three layers, lowest priority first:
//! compiled-in defaults, an optional TOML file, and command-line flags.
//! The result is an immutable [`RunConfig`] plus a
//! [`RequestTemplate`](crate::template::RequestTemplate).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sources;
use crate::template::{HeaderOverrides, RequestTemplate};

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV: &str = "LOADSTORM_CONFIG";

/// File name of the response capture sink inside the capture directory.
pub const CAPTURE_FILE_NAME: &str = "responses.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Configuration validation failures. All of these are fatal and are
/// reported before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no target given: supply a URL (-u) or a URL list file (-f)")]
    MissingTarget,

    #[error("requests or period must be provided")]
    MissingStopCondition,

    #[error("only one should be provided: [requests|period]")]
    AmbiguousStopCondition,

    #[error("client count must be at least 1")]
    NoClients,

    #[error("URL list {path} contains no URLs")]
    EmptyUrlList { path: PathBuf },

    #[error("invalid target URL '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("unsupported scheme '{scheme}' in target '{url}' (only http is supported)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("invalid value for header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// When a run stops. Exactly one condition applies to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Each worker stops after issuing this many requests.
    Requests(u64),
    /// The whole run stops once this much wall-clock time has elapsed.
    Duration(Duration),
}

impl StopCondition {
    /// Build a stop condition from the two mutually exclusive inputs.
    pub fn from_inputs(requests: Option<u64>, period_secs: Option<u64>) -> Result<Self, ConfigError> {
        match (requests, period_secs) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousStopCondition),
            (None, None) => Err(ConfigError::MissingStopCondition),
            (Some(n), None) => Ok(Self::Requests(n)),
            (None, Some(secs)) => Ok(Self::Duration(Duration::from_secs(secs))),
        }
    }

    /// Per-worker request quota, if the run is quota-bound.
    pub fn quota(&self) -> Option<u64> {
        match self {
            Self::Requests(n) => Some(*n),
            Self::Duration(_) => None,
        }
    }
}

/// Socket timeouts applied by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on waiting for the response head and, separately, the body.
    pub read: Duration,
    /// Bound on establishing the connection.
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(5000),
            write: Duration::from_millis(5000),
        }
    }
}

/// Resolved, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of parallel workers.
    pub clients: usize,
    pub stop: StopCondition,
    pub timeouts: Timeouts,
    /// Directory receiving `responses.json`, if response capture is on.
    pub capture_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Full path of the capture sink, if capture is enabled.
    pub fn capture_path(&self) -> Option<PathBuf> {
        self.capture_dir.as_ref().map(|dir| dir.join(CAPTURE_FILE_NAME))
    }
}

// ---------------------------------------------------------------------------
// Settings (CLI layer)
// ---------------------------------------------------------------------------

/// Raw settings as given on the command line. `None` means "not given",
/// in which case the config file and then the defaults apply.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub url: Option<String>,
    pub urls_file: Option<PathBuf>,
    pub method: Option<String>,
    pub clients: Option<usize>,
    pub requests: Option<u64>,
    pub period: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub keep_alive: Option<bool>,
    pub authorization: Option<String>,
    pub geolocation: Option<String>,
    pub content_type: Option<String>,
    pub api_user_name: Option<String>,
    pub data_file: Option<PathBuf>,
    pub capture_dir: Option<PathBuf>,
}

/// Output of [`Settings::resolve`].
#[derive(Debug)]
pub struct Resolved {
    pub run: RunConfig,
    pub template: RequestTemplate,
}

impl Settings {
    /// Validate the settings against `file` and produce the run
    /// configuration and request template.
    ///
    /// Validation order: target presence, stop condition, client count,
    /// then file reads and template construction.
    pub fn resolve(self, file: &FileConfig) -> Result<Resolved, ConfigError> {
        if self.url.is_none() && self.urls_file.is_none() {
            return Err(ConfigError::MissingTarget);
        }

        let stop = StopCondition::from_inputs(self.requests, self.period)?;

        let clients = self.clients.unwrap_or(file.load.clients);
        if clients == 0 {
            return Err(ConfigError::NoClients);
        }

        let mut targets = Vec::new();
        if let Some(path) = &self.urls_file {
            let lines = sources::read_url_list(path)?;
            if lines.is_empty() && self.url.is_none() {
                return Err(ConfigError::EmptyUrlList { path: path.clone() });
            }
            targets.extend(lines);
        }
        if let Some(url) = self.url {
            targets.push(url);
        }

        let mut method = self.method.unwrap_or_else(|| file.load.method.clone());
        let body = match &self.data_file {
            Some(path) => {
                method = "POST".to_string();
                Some(sources::read_body(path)?)
            }
            None => None,
        };

        let headers = HeaderOverrides {
            authorization: self.authorization.or_else(|| file.headers.authorization.clone()),
            geolocation: self.geolocation.or_else(|| file.headers.geolocation.clone()),
            content_type: self.content_type.or_else(|| file.headers.content_type.clone()),
            api_user_name: self.api_user_name.or_else(|| file.headers.api_user_name.clone()),
        };

        let keep_alive = self.keep_alive.unwrap_or(file.load.keep_alive);

        let mut builder = RequestTemplate::builder()
            .targets(targets)
            .method(&method)
            .headers(headers)
            .keep_alive(keep_alive);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let template = builder.build()?;

        let timeouts = Timeouts {
            read: Duration::from_millis(self.read_timeout_ms.unwrap_or(file.load.read_timeout_ms)),
            write: Duration::from_millis(self.write_timeout_ms.unwrap_or(file.load.write_timeout_ms)),
        };

        let run = RunConfig {
            clients,
            stop,
            timeouts,
            capture_dir: self.capture_dir.or_else(|| file.capture.dir.clone()),
        };

        Ok(Resolved { run, template })
    }
}

// ---------------------------------------------------------------------------
// TOML file layer
// ---------------------------------------------------------------------------

/// Root of the optional TOML configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub headers: HeaderConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FileConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Resolve the config file to use, in order:
    /// 1. `explicit` (the `--config` flag). A load failure here is an error.
    /// 2. The path in `LOADSTORM_CONFIG`. A load failure falls back to defaults.
    /// 3. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, using defaults",
                        CONFIG_ENV
                    );
                }
            }
        }

        debug!("no config file, using compiled-in defaults");
        Ok(Self::default())
    }
}

/// Load-shape defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Number of concurrent clients.
    pub clients: usize,
    /// Whether connections are kept alive between requests.
    pub keep_alive: bool,
    /// HTTP method used unless a body file forces POST.
    pub method: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            clients: 100,
            keep_alive: true,
            method: "GET".to_string(),
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

/// Header values sent with every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub authorization: Option<String>,
    pub geolocation: Option<String>,
    pub content_type: Option<String>,
    pub api_user_name: Option<String>,
}

/// Response capture settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory that receives `responses.json`.
    pub dir: Option<PathBuf>,
}

/// Log output settings. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit logs as JSON lines instead of the human formatter.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
