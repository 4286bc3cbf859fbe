//! INI configuration file.
//!
//! ```ini
//! [engine]
//! threads = 4
//! retries = 3
//! retry_delay_ms = 1000
//! backoff = fixed            ; or exponential
//! stagger_delay_ms = 1000
//! batch_size_min_bytes = 4194304
//! pass_timeout_secs = 1800
//! max_passes = 8
//! verify_checksums = true
//!
//! [output]
//! directory = output
//! flat = false
//! set_last_modified = true
//! force_overwrite = false
//!
//! [logging]
//! level = info
//! file = /var/log/snapfetch.log
//! ```
//!
//! Missing sections and keys fall back to their defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::retry::RetryPolicy;

/// Application directory below the user's config dir.
pub const CONFIG_DIR_NAME: &str = "snapfetch";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Default output directory.
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "output";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("invalid value '{value}' for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// `[output]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Write `<root>/<path>` instead of `<root>/<udid>/<domain>/<path>`.
    pub flat: bool,
    pub set_last_modified: bool,
    pub force_overwrite: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            flat: false,
            set_last_modified: true,
            force_overwrite: false,
        }
    }
}

/// `[logging]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Optional log file, written in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Default location: `<config dir>/snapfetch/config.ini`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from the default location, or defaults if no file exists there.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text)?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("engine")) {
            let s = Section::new("engine", section);
            let engine = &mut config.engine;

            if let Some(threads) = s.parse::<usize>("threads")? {
                if threads == 0 {
                    return Err(s.invalid("threads", "0"));
                }
                engine.thread_count = threads;
            }

            let retries = s.parse::<u32>("retries")?.unwrap_or(engine.retry.max_retries());
            let delay = s
                .parse::<u64>("retry_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(crate::retry::DEFAULT_RETRY_DELAY_MS));
            engine.retry = match s.get("backoff").filter(|b| !b.is_empty()).unwrap_or("fixed") {
                "fixed" => RetryPolicy::fixed(retries, delay),
                "exponential" => RetryPolicy::exponential(retries, delay),
                other => return Err(s.invalid("backoff", other)),
            };

            if let Some(ms) = s.parse::<u64>("stagger_delay_ms")? {
                engine.stagger_delay = Duration::from_millis(ms);
            }
            if let Some(bytes) = s.parse::<u64>("batch_size_min_bytes")? {
                engine.batch_size_min_bytes = bytes;
            }
            if let Some(secs) = s.parse::<u64>("pass_timeout_secs")? {
                engine.pass_timeout = Duration::from_secs(secs);
            }
            if let Some(passes) = s.parse::<u32>("max_passes")? {
                if passes == 0 {
                    return Err(s.invalid("max_passes", "0"));
                }
                engine.max_passes = passes;
            }
            if let Some(verify) = s.parse_bool("verify_checksums")? {
                engine.verify_checksums = verify;
            }
        }

        if let Some(section) = ini.section(Some("output")) {
            let s = Section::new("output", section);
            let output = &mut config.output;

            if let Some(dir) = s.get("directory").filter(|d| !d.is_empty()) {
                output.directory = PathBuf::from(dir);
            }
            if let Some(flat) = s.parse_bool("flat")? {
                output.flat = flat;
            }
            if let Some(set) = s.parse_bool("set_last_modified")? {
                output.set_last_modified = set;
            }
            if let Some(force) = s.parse_bool("force_overwrite")? {
                output.force_overwrite = force;
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            let s = Section::new("logging", section);

            if let Some(level) = s.get("level").filter(|l| !l.is_empty()) {
                config.logging.level = level.to_string();
            }
            config.logging.file = s.get("file").filter(|f| !f.is_empty()).map(PathBuf::from);
        }

        Ok(config)
    }
}

/// Typed access to one INI section.
struct Section<'a> {
    name: &'static str,
    properties: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, properties: &'a Properties) -> Self {
        Self { name, properties }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.properties.get(key).map(str::trim)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, value)),
        }
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None | Some("") => Ok(None),
            Some("true" | "yes" | "on" | "1") => Ok(Some(true)),
            Some("false" | "no" | "off" | "0") => Ok(Some(false)),
            Some(other) => Err(self.invalid(key, other)),
        }
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
