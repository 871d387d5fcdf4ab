use std::{path::Path, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{color::default_palette, tempo::TempoRange, BeatLightError, Bpm, Result, Rgb};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_palette")]
    pub palette: Vec<Rgb>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            tempo: TempoConfig::default(),
            latency: LatencyConfig::default(),
            scheduler: SchedulerConfig::default(),
            palette: default_palette(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BeatLightError::config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            BeatLightError::config(format!("cannot parse {}: {err}", path.display()))
        })
    }

    /// Checks everything that must hold before a session may start.
    pub fn validate(&self) -> Result<()> {
        self.device.target()?;
        self.tempo.initial_bpm()?;

        if !(self.tempo.tap_tolerance > 0.0 && self.tempo.tap_tolerance < 1.0) {
            return Err(BeatLightError::config("tempo.tap_tolerance must be in (0, 1)"));
        }
        if self.latency.window == 0 {
            return Err(BeatLightError::config("latency.window must be at least 1"));
        }
        if !(self.latency.percentile > 0.0 && self.latency.percentile <= 1.0) {
            return Err(BeatLightError::config("latency.percentile must be in (0, 1]"));
        }
        if self.latency.outlier_factor < 1.0 {
            return Err(BeatLightError::config("latency.outlier_factor must be >= 1"));
        }
        if self.palette.is_empty() {
            return Err(BeatLightError::config("palette must contain at least one color"));
        }
        Ok(())
    }
}

/// Where the device API lives and which controller to address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub base_url: Option<String>,
    pub device_id: Option<String>,
    pub timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            device_id: None,
            timeout_ms: 1_000,
        }
    }
}

impl DeviceConfig {
    /// Resolves the required connection details.
    pub fn target(&self) -> Result<DeviceTarget> {
        let base_url = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| BeatLightError::config("device base URL is not set"))?;
        let device_id = self
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BeatLightError::config("device id is not set"))?;

        let parsed = Url::parse(base_url)
            .map_err(|err| BeatLightError::config(format!("invalid base URL `{base_url}`: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BeatLightError::config(format!(
                "base URL `{base_url}` must use http or https"
            )));
        }
        if self.timeout_ms == 0 {
            return Err(BeatLightError::config("device.timeout_ms must be positive"));
        }

        Ok(DeviceTarget {
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

/// Validated connection details consumed by the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub base_url: String,
    pub device_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub initial_bpm: f64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Allowed deviation of a tap interval from the median, as a fraction.
    pub tap_tolerance: f64,
    pub tap_history: usize,
    pub tap_reset_ms: u64,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            initial_bpm: 120.0,
            min_bpm: 20.0,
            max_bpm: 300.0,
            tap_tolerance: 0.3,
            tap_history: 8,
            tap_reset_ms: 2_000,
        }
    }
}

impl TempoConfig {
    pub fn range(&self) -> TempoRange {
        TempoRange {
            min: self.min_bpm,
            max: self.max_bpm,
        }
    }

    pub fn initial_bpm(&self) -> Result<Bpm> {
        if !(self.min_bpm > 0.0 && self.min_bpm < self.max_bpm) {
            return Err(BeatLightError::config(format!(
                "tempo range {}-{} is empty",
                self.min_bpm, self.max_bpm
            )));
        }
        self.range()
            .validate(self.initial_bpm)
            .map_err(|err| BeatLightError::config(err.to_string()))
    }

    pub fn tap_reset(&self) -> Duration {
        Duration::from_millis(self.tap_reset_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Number of recent measurements kept.
    pub window: usize,
    pub percentile: f64,
    /// Samples above `outlier_factor * median` are ignored for compensation.
    pub outlier_factor: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            window: 50,
            percentile: 0.9,
            outlier_factor: 3.0,
        }
    }
}

/// What the device is left showing when an effect or session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    PowerOff,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub horizon_ms: u64,
    pub min_spacing_ms: u64,
    pub max_in_flight_ms: u64,
    pub resync_threshold_ms: u64,
    pub on_stop: StopAction,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            horizon_ms: 40,
            min_spacing_ms: 40,
            max_in_flight_ms: 400,
            resync_threshold_ms: 100,
            on_stop: StopAction::PowerOff,
        }
    }
}

impl SchedulerConfig {
    pub fn horizon(&self) -> Duration {
        Duration::from_millis(self.horizon_ms)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn max_in_flight(&self) -> Duration {
        Duration::from_millis(self.max_in_flight_ms)
    }

    pub fn resync_threshold(&self) -> Duration {
        Duration::from_millis(self.resync_threshold_ms)
    }
}
