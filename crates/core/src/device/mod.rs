use std::{future::Future, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::{config::DeviceTarget, BeatLightError, Result, Rgb};

/// Presets built into the controller firmware, addressable by name through
/// the effect endpoint.
pub const BUILTIN_EFFECTS: [&str; 20] = [
    "seven_color_cross_fade",
    "red_gradual_change",
    "green_gradual_change",
    "blue_gradual_change",
    "yellow_gradual_change",
    "cyan_gradual_change",
    "purple_gradual_change",
    "white_gradual_change",
    "red_green_cross_fade",
    "red_blue_cross_fade",
    "green_blue_cross_fade",
    "seven_color_strobe_flash",
    "red_strobe_flash",
    "green_strobe_flash",
    "blue_stobe_flash",
    "yellow_strobe_flash",
    "cyan_strobe_flash",
    "purple_strobe_flash",
    "white_strobe_flash",
    "seven_color_jumping",
];

pub const FLASH_EFFECT: &str = "white_strobe_flash";

/// One state change for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `brightness` uses the device's 0-100 scale.
    Color { color: Rgb, brightness: u8 },
    Power { on: bool },
    Effect { name: String, speed: u8 },
}

impl DeviceCommand {
    fn endpoint(&self) -> &'static str {
        match self {
            Self::Color { .. } => "/api/color",
            Self::Power { .. } => "/api/power",
            Self::Effect { .. } => "/api/effect",
        }
    }
}

/// Confirmation that the API applied a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAck {
    pub elapsed: Duration,
}

/// Anything that can apply [`DeviceCommand`]s. The scheduler only talks to
/// the device through this trait.
pub trait LightDevice: Send + Sync + 'static {
    /// Sends exactly one command. Implementations must not retry.
    fn send(&self, command: &DeviceCommand) -> impl Future<Output = Result<DeviceAck>> + Send;
}

#[derive(Serialize)]
struct ColorBody<'a> {
    id: &'a str,
    color: String,
    brightness: u8,
}

#[derive(Serialize)]
struct PowerBody<'a> {
    id: &'a str,
    power: bool,
}

#[derive(Serialize)]
struct EffectBody<'a> {
    id: &'a str,
    effect: &'a str,
    speed: u8,
}

/// Client for the magic-home-rest HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDevice {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
}

impl HttpDevice {
    pub fn new(target: &DeviceTarget) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(target.timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: target.base_url.clone(),
            device_id: target.device_id.clone(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn send_command(&self, command: &DeviceCommand) -> Result<DeviceAck> {
        let url = self.url(command.endpoint());
        let started = Instant::now();

        let request = self.http.post(&url);
        let id = self.device_id.as_str();
        let request = match command {
            DeviceCommand::Color { color, brightness } => request.json(&ColorBody {
                id,
                color: color.to_hex(),
                brightness: (*brightness).min(100),
            }),
            DeviceCommand::Power { on } => request.json(&PowerBody { id, power: *on }),
            DeviceCommand::Effect { name, speed } => request.json(&EffectBody {
                id,
                effect: name,
                speed: (*speed).min(100),
            }),
        };

        let response = request
            .send()
            .await
            .map_err(|err| classify(&url, err))?;
        let status = response.status();
        let body = response.text().await.map_err(|err| classify(&url, err))?;

        if !status.is_success() || body.trim() != "OK" {
            return Err(BeatLightError::Device {
                status: status.as_u16(),
                body,
            });
        }

        let elapsed = started.elapsed();
        tracing::trace!(?command, ?elapsed, "device acknowledged command");
        Ok(DeviceAck { elapsed })
    }

    /// Lists the controllers the API knows about.
    pub async fn list_devices(&self) -> Result<serde_json::Value> {
        self.get_json(&self.url("/api/devices")).await
    }

    /// Reads the current state of the configured controller.
    pub async fn device_state(&self) -> Result<serde_json::Value> {
        let url = self.url(&format!("/api/device/{}", self.device_id));
        self.get_json(&url).await
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| classify(url, err))?;
        let status = response.status();
        let body = response.text().await.map_err(|err| classify(url, err))?;
        if !status.is_success() {
            return Err(BeatLightError::Device {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl LightDevice for HttpDevice {
    fn send(&self, command: &DeviceCommand) -> impl Future<Output = Result<DeviceAck>> + Send {
        self.send_command(command)
    }
}

fn classify(url: &str, err: reqwest::Error) -> BeatLightError {
    if err.is_timeout() || err.is_connect() {
        BeatLightError::Unreachable {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        BeatLightError::Http(err)
    }
}
