use std::{
    error::Error,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{capture::MAX_SNAPLEN, runtime::cli::Cli};

/// Run configuration, built once at startup and never changed afterwards.
///
/// Layered Defaults < YAML file < environment < CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Conf {
    /// Capture device name.
    pub interface: String,

    /// Optional capture filter; absent or blank captures all traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Requested snapshot length in bytes.
    #[serde(default = "defaults::snaplen")]
    pub snaplen: u32,

    /// Verbosity counter; selects the log level.
    #[serde(default)]
    pub verbose: u8,

    /// Put the device into promiscuous mode.
    #[serde(default = "defaults::promiscuous")]
    pub promiscuous: bool,

    /// Most packets delivered per capture readiness event.
    /// - Default: 10000
    #[serde(default = "defaults::max_batch")]
    pub max_batch: usize,

    /// Period of the recurring alarm. Whole seconds only.
    /// - Default: 1s
    #[serde(default = "defaults::tick_interval", with = "duration")]
    pub tick_interval: Duration,

    /// Emit capture statistics every N ticks.
    /// - Default: 10
    #[serde(default = "defaults::stats_every_ticks")]
    pub stats_every_ticks: u64,

    /// Ready descriptors taken from one wait. With 1, a second ready source is
    /// picked up by the next wait instead of the current one.
    /// - Default: 1
    #[serde(default = "defaults::max_events_per_wait")]
    pub max_events_per_wait: usize,

    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            interface: defaults::interface(),
            filter: None,
            snaplen: defaults::snaplen(),
            verbose: 0,
            promiscuous: defaults::promiscuous(),
            max_batch: defaults::max_batch(),
            tick_interval: defaults::tick_interval(),
            stats_every_ticks: defaults::stats_every_ticks(),
            max_events_per_wait: defaults::max_events_per_wait(),
            config_path: None,
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn interface() -> String {
        "eth0".to_string()
    }

    pub fn snaplen() -> u32 {
        65535
    }

    pub fn promiscuous() -> bool {
        true
    }

    pub fn max_batch() -> usize {
        10_000
    }

    pub fn tick_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn stats_every_ticks() -> u64 {
        10
    }

    pub fn max_events_per_wait() -> usize {
        1
    }
}

impl Conf {
    /// Builds the configuration from defaults, the optional YAML file named by
    /// `cli.config`, and the CLI/environment values, in that priority order.
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - the named config file does not exist.
    /// * `ConfigError::InvalidConfigPath` - the path is not a regular file.
    /// * `ConfigError::InvalidExtension` - the file is not `.yaml`/`.yml`.
    /// * `ConfigError::Invalid` - a value is out of range.
    /// * `ConfigError::Extraction` - the merged document does not deserialize.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = config_path_to_store;
        conf.validate()?;

        Ok((conf, cli))
    }

    /// Range checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.trim().is_empty() {
            return Err(ConfigError::invalid("interface", "must not be empty"));
        }
        if self.snaplen == 0 || self.snaplen > MAX_SNAPLEN {
            return Err(ConfigError::invalid(
                "snaplen",
                format!("must be between 1 and {MAX_SNAPLEN}, got {}", self.snaplen),
            ));
        }
        if self.max_batch == 0 {
            return Err(ConfigError::invalid("max_batch", "must be positive"));
        }
        if self.stats_every_ticks == 0 {
            return Err(ConfigError::invalid("stats_every_ticks", "must be positive"));
        }
        if self.max_events_per_wait == 0 {
            return Err(ConfigError::invalid("max_events_per_wait", "must be positive"));
        }
        if self.tick_interval.as_secs() == 0 || self.tick_interval.subsec_nanos() != 0 {
            return Err(ConfigError::invalid(
                "tick_interval",
                format!(
                    "must be a whole number of seconds, got {}",
                    humantime::format_duration(self.tick_interval)
                ),
            ));
        }
        Ok(())
    }

    /// The filter expression if one is set and not blank.
    pub fn filter_expr(&self) -> Option<&str> {
        self.filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }
}

/// Validates that the given path points to an existing file with a supported extension.
///
/// # Errors
///
/// * `ConfigError::NoConfigFile` if nothing exists at `path`.
/// * `ConfigError::InvalidConfigPath` if it is not a file.
/// * `ConfigError::InvalidExtension` if it does not end in `yaml` or `yml`.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NoConfigFile);
    }
    if !path.is_file() {
        return Err(ConfigError::InvalidConfigPath(path.display().to_string()));
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// Error: The specified configuration file does not exist.
    NoConfigFile,
    /// Error: The path exists but is not a file (e.g., it's a directory).
    InvalidConfigPath(String),
    /// Error: The file has an unsupported extension.
    InvalidExtension(String),
    /// Error: A value is outside its allowed range.
    Invalid { field: &'static str, reason: String },
    /// Error: Failed to extract configuration data.
    Extraction(Box<figment::Error>),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigFile => write!(f, "no config file provided"),
            ConfigError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfigError::InvalidExtension(ext) => {
                write!(f, "invalid file extension '.{ext}', expected 'yaml' or 'yml'")
            }
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
            ConfigError::Extraction(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Extraction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extraction(Box::from(e))
    }
}

pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
