//! Bench configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/board_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `BOARD_DAQ_`, nested keys
//!    separated by a double underscore
//!
//! # Example
//! ```no_run
//! use board_daq::config::BenchConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BenchConfig::load()?;
//! println!("Scope at {}", config.oscilloscope.endpoint());
//! # Ok(())
//! # }
//! ```
//!
//! `BOARD_DAQ_OSCILLOSCOPE__HOST=10.0.0.7` overrides `oscilloscope.host`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::scpi::{ScopeChannel, MAX_SCOPE_CHANNEL};
use crate::session::{DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_WAVEFORM_TIMEOUT_MS};
use crate::transport::InstrumentEndpoint;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/board_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BOARD_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Oscilloscope connection
    #[serde(default = "default_oscilloscope")]
    pub oscilloscope: ScopeConfig,
    /// Multimeter connection
    #[serde(default = "default_multimeter")]
    pub multimeter: InstrumentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Network location of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request deadline in milliseconds
    pub timeout_ms: u64,
}

/// Oscilloscope connection plus the channel to capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Network location
    #[serde(flatten)]
    pub instrument: InstrumentConfig,
    /// Analog channel to capture (1-4)
    #[serde(default = "default_channel")]
    pub channel: u8,
}

fn default_name() -> String {
    "Board DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel() -> u8 {
    1
}

fn default_oscilloscope() -> ScopeConfig {
    ScopeConfig {
        instrument: InstrumentConfig {
            host: "192.168.0.200".to_string(),
            port: 5555,
            timeout_ms: DEFAULT_WAVEFORM_TIMEOUT_MS,
        },
        channel: default_channel(),
    }
}

fn default_multimeter() -> InstrumentConfig {
    InstrumentConfig {
        host: "192.168.0.201".to_string(),
        port: 5025,
        timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            oscilloscope: default_oscilloscope(),
            multimeter: default_multimeter(),
        }
    }
}

impl InstrumentConfig {
    /// Endpoint value handed to sessions.
    pub fn endpoint(&self) -> InstrumentEndpoint {
        InstrumentEndpoint::new(self.host.clone(), self.port, self.timeout_ms)
    }

    fn validate(&self, name: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("{name}.host must not be empty"));
        }
        if self.port == 0 {
            return Err(format!("{name}.port must not be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(format!("{name}.timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

impl ScopeConfig {
    /// Endpoint value handed to sessions.
    pub fn endpoint(&self) -> InstrumentEndpoint {
        self.instrument.endpoint()
    }

    /// Configured channel, if valid.
    pub fn scope_channel(&self) -> Option<ScopeChannel> {
        ScopeChannel::new(self.channel)
    }
}

impl BenchConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.oscilloscope.instrument.validate("oscilloscope")?;
        self.multimeter.validate("multimeter")?;

        if self.oscilloscope.scope_channel().is_none() {
            return Err(format!(
                "Invalid oscilloscope.channel {}. Must be 1-{}",
                self.oscilloscope.channel, MAX_SCOPE_CHANNEL
            ));
        }

        Ok(())
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
