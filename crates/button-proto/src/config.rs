use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("At least one button must be configured")]
    NoButtons,

    #[error("Duplicate pin numbers are not allowed (pin {0})")]
    DuplicatePin(u32),

    #[error("MIDI file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Invalid base_url '{0}': expected an http:// or https:// URL")]
    InvalidBaseUrl(String),

    #[error("Unknown log level '{0}'")]
    InvalidLogLevel(String),

    #[error("Pin {pin} is not a GPIO line in {mode:?} numbering")]
    InvalidPin { pin: u32, mode: GpioMode },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub moppy_api: MoppyApiConfig,
    pub buttons: Vec<ButtonConfig>,
    pub gpio: GpioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

/// Connection settings for the remote playback service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoppyApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    pub base_url: String,
    /// Upper bound for a single request.  Absent means requests are not
    /// bounded on our side and a hung service keeps its pin busy.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl MoppyApiConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// One physical button: the pin it is wired to and the song it triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub pin: u32,
    pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpioMode {
    Bcm,
    Board,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullMode {
    PudUp,
    PudDown,
    PudOff,
}

/// Hardware input settings.  The bounce time applies to presses from every
/// input surface, not only the pins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    /// Claim the configured pins.  Off for development machines that only
    /// drive presses over the socket or HTTP.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_gpio_mode")]
    pub mode: GpioMode,
    #[serde(default = "default_pull_mode")]
    pub pull_up_down: PullMode,
    /// Milliseconds.
    #[serde(default = "default_bounce_time")]
    pub bounce_time: u64,
}

/// BCM line behind each physical pin of the 40-pin header; `None` for
/// power and ground.
#[rustfmt::skip]
const BOARD_TO_BCM: [Option<u8>; 41] = [
    None,
    None, None, Some(2), None, Some(3), None, Some(4), Some(14), None, Some(15),
    Some(17), Some(18), Some(27), None, Some(22), Some(23), None, Some(24), Some(10), None,
    Some(9), Some(25), Some(11), Some(8), None, Some(7), Some(0), Some(1), Some(5), None,
    Some(6), Some(12), Some(13), None, Some(19), Some(16), Some(26), Some(20), None, Some(21),
];

const MAX_BCM_LINE: u32 = 27;

impl GpioConfig {
    pub fn bounce_window(&self) -> Duration {
        Duration::from_millis(self.bounce_time)
    }

    /// BCM line number for a configured pin under the configured numbering.
    pub fn line_for(&self, pin: u32) -> Option<u8> {
        match self.mode {
            GpioMode::Bcm if pin <= MAX_BCM_LINE => u8::try_from(pin).ok(),
            GpioMode::Bcm => None,
            GpioMode::Board => BOARD_TO_BCM.get(pin as usize).copied().flatten(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    Full,
    Compact,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `full`, `compact` or `pretty`.  Anything else (for instance a
    /// printf-style pattern from an older config) falls back to `full`.
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "platform::default_log_file")]
    pub file: PathBuf,
}

impl LoggingConfig {
    /// `EnvFilter` directive for the configured level.
    pub fn filter_directive(&self) -> Result<&'static str, ConfigError> {
        match self.level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok("trace"),
            "DEBUG" => Ok("debug"),
            "INFO" => Ok("info"),
            "WARN" | "WARNING" => Ok("warn"),
            "ERROR" | "CRITICAL" => Ok("error"),
            _ => Err(ConfigError::InvalidLogLevel(self.level.clone())),
        }
    }

    pub fn style(&self) -> LogStyle {
        match self.format.trim().to_ascii_lowercase().as_str() {
            "compact" => LogStyle::Compact,
            "pretty" => LogStyle::Pretty,
            _ => LogStyle::Full,
        }
    }
}

/// Local surfaces that deliver press events into the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_enabled")]
    pub http_enabled: bool,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_enabled")]
    pub socket_enabled: bool,
    #[serde(default = "default_socket_port")]
    pub socket_port: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_to_file: false,
            file: platform::default_log_file(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_enabled: default_enabled(),
            http_port: default_http_port(),
            socket_enabled: default_enabled(),
            socket_port: default_socket_port(),
        }
    }
}

fn default_api_host() -> String {
    "localhost".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_gpio_mode() -> GpioMode {
    GpioMode::Bcm
}

fn default_pull_mode() -> PullMode {
    PullMode::PudUp
}

fn default_bounce_time() -> u64 {
    300
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

fn default_bind_address() -> String {
    platform::DEFAULT_BIND_ADDRESS.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    platform::DAEMON_HTTP_PORT
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

impl Config {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse the YAML file at `path`.  Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buttons.is_empty() {
            return Err(ConfigError::NoButtons);
        }

        let mut seen = HashSet::new();
        for button in &self.buttons {
            if !seen.insert(button.pin) {
                return Err(ConfigError::DuplicatePin(button.pin));
            }
        }

        for button in &self.buttons {
            let path = Path::new(&button.file);
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
        }

        let url = self.moppy_api.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.moppy_api.base_url.clone()));
        }

        if self.gpio.enabled {
            for button in &self.buttons {
                if self.gpio.line_for(button.pin).is_none() {
                    return Err(ConfigError::InvalidPin {
                        pin: button.pin,
                        mode: self.gpio.mode,
                    });
                }
            }
        }

        self.logging.filter_directive()?;
        Ok(())
    }
}
