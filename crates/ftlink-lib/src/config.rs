//! Application configuration — TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::OverflowPolicy;
use crate::link::{DataBits, FlowControl, LinkConfiguration, Parity, StopBits};
use crate::read_loop::ReadLoopConfig;
use crate::session::SessionOptions;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# ftlink configuration. Unknown link codes fall back to 8N1 without flow control.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device to open, by enumeration index. Default: 0 (first bridge).
    #[serde(default)]
    pub device_index: usize,

    /// Baud rate in bits per second. Default: 9600.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits: 7 or 8. Default: 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: i64,

    /// Stop bits: 1 or 2. Default: 1.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: i64,

    /// Parity: 0 none, 1 odd, 2 even, 3 mark, 4 space. Default: 0.
    #[serde(default)]
    pub parity: i64,

    /// Flow control: 0 none, 1 RTS/CTS, 2 DTR/DSR, 3 XON/XOFF. Default: 0.
    #[serde(default)]
    pub flow_control: i64,

    /// Bound on one receive poll, in milliseconds. Default: 50.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Bound on one write, in milliseconds. Default: 1000.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Receive buffer size per poll cycle, in bytes. Default: 4096.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Notification queue bound, in messages. Default: 256.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// What to do when the consumer falls behind: "backpressure" or "drop-oldest".
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: String,

    /// Shortest idle wait between empty polls, in milliseconds. Default: 1.
    #[serde(default = "default_idle_poll_min_ms")]
    pub idle_poll_min_ms: u64,

    /// Longest idle wait between empty polls, in milliseconds. Default: 16.
    #[serde(default = "default_idle_poll_max_ms")]
    pub idle_poll_max_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> i64 {
    8
}
fn default_stop_bits() -> i64 {
    1
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_buffer_capacity() -> usize {
    crate::protocol::RX_BUFFER_CAPACITY
}
fn default_channel_capacity() -> usize {
    crate::channel::DEFAULT_CAPACITY
}
fn default_overflow_policy() -> String {
    OverflowPolicy::default().as_str().into()
}
fn default_idle_poll_min_ms() -> u64 {
    1
}
fn default_idle_poll_max_ms() -> u64 {
    16
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_index: 0,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: 0,
            flow_control: 0,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            buffer_capacity: default_buffer_capacity(),
            channel_capacity: default_channel_capacity(),
            overflow_policy: default_overflow_policy(),
            idle_poll_min_ms: default_idle_poll_min_ms(),
            idle_poll_max_ms: default_idle_poll_max_ms(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `baud_rate` is zero.
    ZeroBaudRate,
    /// A size or timeout that must be positive is zero.
    ZeroValue { field: &'static str },
    /// `overflow_policy` is not a known policy.
    InvalidOverflowPolicy(String),
    /// `idle_poll_min_ms` exceeds `idle_poll_max_ms`.
    IdleRange { min: u64, max: u64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ZeroBaudRate => write!(f, "baud_rate must be greater than 0"),
            ValidationError::ZeroValue { field } => write!(f, "{field} must be greater than 0"),
            ValidationError::InvalidOverflowPolicy(e) => write!(f, "Invalid overflow_policy: {e}"),
            ValidationError::IdleRange { min, max } => write!(
                f,
                "idle_poll_min_ms ({min}) must not exceed idle_poll_max_ms ({max})"
            ),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ftlink"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    ///
    /// A header comment is prepended to explain the defaulting of link codes.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// The link configuration these settings describe, with unknown codes
    /// defaulted.
    pub fn link(&self) -> LinkConfiguration {
        LinkConfiguration::from_raw(
            self.baud_rate,
            self.data_bits,
            self.stop_bits,
            self.parity,
            self.flow_control,
        )
    }

    /// Parsed overflow policy; the default if the field is invalid.
    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow_policy.parse().unwrap_or_default()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            link: self.link(),
            read_loop: ReadLoopConfig {
                buffer_capacity: self.buffer_capacity,
                idle_min: Duration::from_millis(self.idle_poll_min_ms),
                idle_max: Duration::from_millis(self.idle_poll_max_ms),
            },
            channel_capacity: self.channel_capacity,
            overflow: self.overflow(),
        }
    }

    /// Link codes that will be replaced by a default when applied.
    ///
    /// These are not validation errors: the translator accepts any code.
    pub fn link_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if DataBits::parse(self.data_bits).is_none() {
            warnings.push(format!("data_bits = {} is not 7 or 8, using 8", self.data_bits));
        }
        if StopBits::parse(self.stop_bits).is_none() {
            warnings.push(format!("stop_bits = {} is not 1 or 2, using 1", self.stop_bits));
        }
        if Parity::parse(self.parity).is_none() {
            warnings.push(format!("parity = {} is not 0..=4, using none", self.parity));
        }
        if FlowControl::parse(self.flow_control).is_none() {
            warnings.push(format!(
                "flow_control = {} is not 0..=3, using none",
                self.flow_control
            ));
        }
        warnings
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.baud_rate == 0 {
            errors.push(ValidationError::ZeroBaudRate);
        }

        let positive = [
            ("read_timeout_ms", self.read_timeout_ms as usize),
            ("write_timeout_ms", self.write_timeout_ms as usize),
            ("buffer_capacity", self.buffer_capacity),
            ("channel_capacity", self.channel_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError::ZeroValue { field });
            }
        }

        if let Err(e) = self.overflow_policy.parse::<OverflowPolicy>() {
            errors.push(ValidationError::InvalidOverflowPolicy(e));
        }

        if self.idle_poll_min_ms > self.idle_poll_max_ms {
            errors.push(ValidationError::IdleRange {
                min: self.idle_poll_min_ms,
                max: self.idle_poll_max_ms,
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
