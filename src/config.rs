//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/ofdr.toml` (or the path given on the command line)
//! 2. Environment variables prefixed with `OFDR_`, nested keys separated by `__`
//!
//! Every field has a default, so an empty or missing file yields a runnable
//! configuration. Durations use humantime syntax (`"8s"`, `"500ms"`).
//!
//! # Example
//! ```no_run
//! use ofdr_control::config::ControlConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControlConfig::load()?;
//! config.validate()?;
//! println!("Listening on {}", config.server.listen_addr);
//! # Ok(())
//! # }
//! ```
//!
//! Override from the environment: `OFDR_SCHEDULER__MEASURE_TIMEOUT=30s`.

use crate::error::ControlResult;
use crate::logging::OutputFormat;
use crate::protocol::{ChecksumPolicy, CountValidation, FrameOptions, PeakLayout};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ofdr.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "OFDR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Client gateway settings
    pub server: ServerConfig,
    /// FLA instrument link
    pub fla: InstrumentConfig,
    /// Optical switch link
    pub switch: SwitchConfig,
    /// Task scheduling deadlines and retention
    pub scheduler: SchedulerConfig,
}

/// Which hardware backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// TCP instrument and serial switch.
    #[default]
    Real,
    /// Simulated hardware.
    Mock,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
    /// Hardware backend
    pub run_mode: RunMode,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "OFDR Control Server".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
            run_mode: RunMode::Real,
        }
    }
}

/// Client gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the line-delimited JSON gateway
    pub listen_addr: String,
    /// Read inactivity after which a connected client is logged as idle
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5600".to_string(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// FLA instrument link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Instrument host name or address
    pub host: String,
    /// Instrument TCP port
    pub port: u16,
    /// Connect plus `OCI` handshake deadline
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for one configuration or auto-peak exchange
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Deadline for a raw scan transfer
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    /// Check the frame scalar against the instrument checksum
    pub verify_checksum: bool,
    /// Accepted checksum deviation
    pub checksum_tolerance: f64,
    /// Declared-count enforcement
    pub count_validation: CountValidation,
    /// Peak value grouping
    pub peak_layout: PeakLayout,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.1".to_string(),
            port: 4300,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(8),
            scan_timeout: Duration::from_secs(20),
            verify_checksum: true,
            checksum_tolerance: 0.1,
            count_validation: CountValidation::Declared,
            peak_layout: PeakLayout::Paired,
        }
    }
}

impl InstrumentConfig {
    /// Codec options for decoding instrument frames.
    pub fn frame_options(&self) -> FrameOptions {
        let checksum = if self.verify_checksum {
            ChecksumPolicy::Verify {
                tolerance: self.checksum_tolerance,
            }
        } else {
            ChecksumPolicy::Off
        };
        FrameOptions::default()
            .with_layout(self.peak_layout)
            .with_count_validation(self.count_validation)
            .with_checksum(checksum)
    }

    /// `host:port` of the instrument.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Optical switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Switch module index used in `SW <index> ...` commands
    pub switch_index: u32,
    /// Input port the instrument is attached to
    pub input_channel: u32,
    /// Output channels clients may submit tasks for
    pub outputs: Vec<u32>,
    /// Deadline for one switch exchange
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Per-channel raw route command (e.g. cascaded `MSW` strings)
    pub routes: BTreeMap<String, String>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            switch_index: 1,
            input_channel: 1,
            outputs: (1..=8).collect(),
            timeout: Duration::from_secs(1),
            routes: BTreeMap::new(),
        }
    }
}

impl SwitchConfig {
    /// Route overrides keyed by output channel.
    pub fn route_table(&self) -> ControlResult<HashMap<u32, String>> {
        self.routes
            .iter()
            .map(|(key, command)| {
                let channel = key.trim().parse::<u32>().map_err(|_| {
                    crate::error::ControlError::Validation(format!(
                        "switch route key '{key}' is not a channel number"
                    ))
                })?;
                Ok((channel, command.trim().to_string()))
            })
            .collect()
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Deadline for routing the switch for one task
    #[serde(with = "humantime_serde")]
    pub switch_timeout: Duration,
    /// Deadline for the measurement phase of one task
    #[serde(with = "humantime_serde")]
    pub measure_timeout: Duration,
    /// Longest a dequeued task waits for the device bus
    #[serde(with = "humantime_serde")]
    pub queue_wait_timeout: Duration,
    /// How long finished tasks stay retrievable
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Retention sweep period
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            switch_timeout: Duration::from_secs(3),
            measure_timeout: Duration::from_secs(30),
            queue_wait_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ControlConfig {
    /// Load configuration from `config/ofdr.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `OFDR_`.
    /// Example: `OFDR_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> ControlResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> ControlResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
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

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid listen_addr '{}'. Expected host:port",
                self.server.listen_addr
            ));
        }

        if self.switch.outputs.is_empty() {
            return Err("switch.outputs must list at least one channel".to_string());
        }
        if self.switch.outputs.contains(&0) {
            return Err("switch.outputs channels are numbered from 1".to_string());
        }

        let routes = self.switch.route_table().map_err(|e| e.to_string())?;
        for channel in routes.keys() {
            if !self.switch.outputs.contains(channel) {
                return Err(format!(
                    "switch route for channel {channel} is not in switch.outputs"
                ));
            }
        }

        let timeouts = [
            ("server.idle_timeout", self.server.idle_timeout),
            ("fla.connect_timeout", self.fla.connect_timeout),
            ("fla.command_timeout", self.fla.command_timeout),
            ("fla.scan_timeout", self.fla.scan_timeout),
            ("switch.timeout", self.switch.timeout),
            ("scheduler.switch_timeout", self.scheduler.switch_timeout),
            ("scheduler.measure_timeout", self.scheduler.measure_timeout),
            ("scheduler.queue_wait_timeout", self.scheduler.queue_wait_timeout),
            ("scheduler.retention", self.scheduler.retention),
            ("scheduler.sweep_interval", self.scheduler.sweep_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(format!("{name} must be greater than zero"));
            }
        }

        if self.fla.verify_checksum
            && !(self.fla.checksum_tolerance.is_finite() && self.fla.checksum_tolerance > 0.0)
        {
            return Err(format!(
                "Invalid checksum_tolerance {}. Must be positive",
                self.fla.checksum_tolerance
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fla.port, 4300);
        assert_eq!(config.switch.outputs, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn loads_toml_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
run_mode = "mock"

[fla]
host = "10.0.0.5"
count_validation = "exact"

[switch]
outputs = [1, 2, 3]
timeout = "500ms"

[switch.routes]
1 = "MSW 1,1,2;9,1,1;"

[scheduler]
measure_timeout = "45s"
"#
        )
        .unwrap();

        let config = ControlConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.run_mode, RunMode::Mock);
        assert_eq!(config.fla.host, "10.0.0.5");
        assert_eq!(config.fla.port, 4300);
        assert_eq!(config.fla.count_validation, CountValidation::Exact);
        assert_eq!(config.switch.timeout, Duration::from_millis(500));
        assert_eq!(config.scheduler.measure_timeout, Duration::from_secs(45));
        assert_eq!(
            config.switch.route_table().unwrap().get(&1).map(String::as_str),
            Some("MSW 1,1,2;9,1,1;")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:5600");
    }

    #[test]
    fn invalid_log_level() {
        let mut config = ControlConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_outputs_and_zero_channel() {
        let mut config = ControlConfig::default();
        config.switch.outputs.clear();
        assert!(config.validate().is_err());

        config.switch.outputs = vec![0, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_route_for_unknown_channel() {
        let mut config = ControlConfig::default();
        config
            .switch
            .routes
            .insert("12".to_string(), "MSW 1,1,2;10,1,4;".to_string());
        assert!(config.validate().is_err());

        config.switch.routes.clear();
        config
            .switch
            .routes
            .insert("one".to_string(), "MSW".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout_and_bad_tolerance() {
        let mut config = ControlConfig::default();
        config.scheduler.switch_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.fla.checksum_tolerance = 0.0;
        assert!(config.validate().is_err());

        config.fla.verify_checksum = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frame_options_follow_instrument_settings() {
        let config = InstrumentConfig::default();
        let options = config.frame_options();
        assert_eq!(
            options.checksum,
            ChecksumPolicy::Verify { tolerance: 0.1 }
        );
        assert_eq!(options.count_validation, CountValidation::Declared);
    }
}
