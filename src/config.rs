use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::broker::DEFAULT_QUEUE_CAPACITY;
use crate::session::RegistryLimits;

/// Top-level config, loaded from TOML. Every section and field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub job: JobConfig,
    pub sessions: SessionSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind the HTTP/WebSocket server.
    pub bind: SocketAddr,
    /// Open the UI in the default browser once listening.
    pub open_browser: bool,
    /// Extra origins allowed for CORS and WebSocket upgrades.
    pub cors_origins: Vec<String>,
    /// Requests per second per peer on the API routes. 0 disables limiting.
    pub rate_limit: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            open_browser: false,
            cors_origins: Vec::new(),
            rate_limit: 0,
        }
    }
}

/// How analysis parameters reach the job process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamEncoding {
    /// `--company=<v> --code=<v> --market=<v>` as separate argv entries.
    #[default]
    Args,
    /// One JSON object on stdin, followed by a newline and EOF.
    StdinJson,
}

/// `[job]` section: how to find and run the external analysis job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Interpreter candidates, tried in order. Bare names are searched on
    /// `PATH`; anything with a path separator is used as given.
    pub interpreters: Vec<String>,
    /// Arguments used to check that an interpreter actually runs.
    /// Empty skips the check.
    pub interpreter_probe: Vec<String>,
    /// Script candidates, tried in order. Relative paths are resolved
    /// against `base_dir`.
    pub scripts: Vec<PathBuf>,
    /// Directory relative script paths are resolved against.
    /// Defaults to the current directory.
    pub base_dir: Option<PathBuf>,
    pub params: ParamEncoding,
    /// Prefix marking diagnostic (stderr) lines in the output stream.
    pub diagnostic_prefix: String,
    /// Kill the job after this many seconds. 0 means no limit.
    pub timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        let entry = Path::new("stock_analysis_a_stock")
            .join("src")
            .join("a_stock_analysis")
            .join("cli_entry.py");
        Self {
            interpreters: vec!["python3".into(), "python".into(), "py".into()],
            interpreter_probe: vec!["--version".into()],
            scripts: vec![
                Path::new("..").join(&entry),
                Path::new("..").join("..").join(&entry),
                entry,
            ],
            base_dir: None,
            params: ParamEncoding::Args,
            diagnostic_prefix: "[stderr] ".into(),
            timeout_secs: 0,
        }
    }
}

impl JobConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// `[sessions]` section: retention and fan-out limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Keep finished sessions this long. 0 keeps them for the process lifetime.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// 0 means unlimited.
    pub max_sessions: usize,
    pub subscriber_queue: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 60,
            max_sessions: 1024,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_sessions: (self.max_sessions > 0).then_some(self.max_sessions),
            subscriber_queue: self.subscriber_queue,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-writable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }
}

/// `$XDG_CONFIG_HOME/jobcast/config.toml` or the platform equivalent.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobcast")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if a config file is world-writable.
///
/// The file names interpreters and scripts that will be executed, so
/// anyone who can edit it can run code as this user.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if mode & 0o002 != 0 {
        tracing::warn!(
            "Config file {} is world-writable (mode {:o}). \
             It controls which programs are executed -- consider restricting permissions to 644.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}
