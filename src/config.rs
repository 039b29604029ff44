use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Trip simulator timing and auto-return behaviour
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Configuration for the trip position simulator.
///
/// The movement/dwell durations were historically hardcoded server-side;
/// they are tunables here so test and demo deployments can run faster.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// Seconds a bus takes to move from one stop to the next (default: 15)
    #[serde(default = "SimulatorConfig::default_seconds_between_stops")]
    pub seconds_between_stops: u64,
    /// Seconds a bus dwells at the final stop, offloading, before the trip
    /// is marked completed (default: 30)
    #[serde(default = "SimulatorConfig::default_final_stop_dwell_seconds")]
    pub final_stop_dwell_seconds: u64,
    /// Interval in seconds between scheduler passes that auto-start due
    /// trips and reconcile the registry with the store (default: 10)
    #[serde(default = "SimulatorConfig::default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    /// Whether completed trips automatically schedule a reverse-direction
    /// return trip for the same bus (default: true)
    #[serde(default = "SimulatorConfig::default_auto_return_enabled")]
    pub auto_return_enabled: bool,
    /// Seconds between a trip completing and its return trip departing
    /// (default: 30)
    #[serde(default = "SimulatorConfig::default_return_buffer_seconds")]
    pub return_buffer_seconds: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seconds_between_stops: Self::default_seconds_between_stops(),
            final_stop_dwell_seconds: Self::default_final_stop_dwell_seconds(),
            scheduler_interval_secs: Self::default_scheduler_interval_secs(),
            auto_return_enabled: Self::default_auto_return_enabled(),
            return_buffer_seconds: Self::default_return_buffer_seconds(),
        }
    }
}

impl SimulatorConfig {
    fn default_seconds_between_stops() -> u64 {
        15
    }
    fn default_final_stop_dwell_seconds() -> u64 {
        30
    }
    fn default_scheduler_interval_secs() -> u64 {
        10
    }
    fn default_auto_return_enabled() -> bool {
        true
    }
    fn default_return_buffer_seconds() -> u64 {
        30
    }

    pub fn validate(&self) {
        assert!(
            self.seconds_between_stops > 0,
            "seconds_between_stops must be at least 1"
        );
        assert!(
            self.scheduler_interval_secs > 0,
            "scheduler_interval_secs must be at least 1"
        );
    }

    pub fn move_interval(&self) -> Duration {
        Duration::from_secs(self.seconds_between_stops)
    }

    pub fn final_stop_dwell(&self) -> Duration {
        Duration::from_secs(self.final_stop_dwell_seconds)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn return_buffer(&self) -> Duration {
        Duration::from_secs(self.return_buffer_seconds)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_defaults_match_legacy_constants() {
        let cfg = SimulatorConfig::default();
        assert_eq!(cfg.seconds_between_stops, 15);
        assert_eq!(cfg.final_stop_dwell_seconds, 30);
        assert_eq!(cfg.return_buffer_seconds, 30);
        assert!(cfg.auto_return_enabled);
        cfg.validate();
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "cors_permissive: true\nsimulator:\n  seconds_between_stops: 5\n",
        )
        .unwrap();
        assert!(cfg.cors_permissive);
        assert_eq!(cfg.simulator.seconds_between_stops, 5);
        assert_eq!(cfg.simulator.final_stop_dwell_seconds, 30);
    }
}
