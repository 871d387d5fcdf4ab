use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    device::{DeviceCommand, FLASH_EFFECT},
    BeatLightError, Result, Rgb,
};

/// Lighting behaviours that follow the beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Brightness ramps up over the span, color advances each span.
    Swell,
    /// Brightness decays over the span, color advances each span.
    Fade,
    /// Alternates between two colors on every beat.
    Strobe,
    /// Cross-fades from one palette color to the next over the span.
    Transition,
    /// Hard color change once per span.
    Switch,
    /// Fires the controller's white flash preset on every beat.
    Pulse,
}

impl EffectKind {
    pub const ALL: [EffectKind; 6] = [
        EffectKind::Swell,
        EffectKind::Fade,
        EffectKind::Strobe,
        EffectKind::Transition,
        EffectKind::Switch,
        EffectKind::Pulse,
    ];

    pub fn default_span(self) -> u32 {
        match self {
            Self::Swell | Self::Transition => 4,
            Self::Fade | Self::Switch => 2,
            Self::Strobe | Self::Pulse => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Swell => "swell",
            Self::Fade => "fade",
            Self::Strobe => "strobe",
            Self::Transition => "transition",
            Self::Switch => "switch",
            Self::Pulse => "pulse",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EffectKind {
    type Err = BeatLightError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered == "beat" {
            return Ok(Self::Pulse);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| BeatLightError::msg(format!("unknown effect `{s}`")))
    }
}

/// An effect together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectSpec {
    pub kind: EffectKind,
    /// Empty means "use the session palette".
    #[serde(default)]
    pub colors: Vec<Rgb>,
    /// Beats covered by one cycle of the effect.
    pub span: u32,
    /// Peak brightness on the device's 0-100 scale.
    pub intensity: u8,
}

impl EffectSpec {
    pub fn new(kind: EffectKind) -> Self {
        Self {
            kind,
            colors: Vec::new(),
            span: kind.default_span(),
            intensity: 100,
        }
    }

    pub fn with_colors(mut self, colors: Vec<Rgb>) -> Self {
        self.colors = colors;
        self
    }

    pub fn with_span(mut self, span: u32) -> Self {
        self.span = span.max(1);
        self
    }

    pub fn with_intensity(mut self, intensity: u8) -> Self {
        self.intensity = intensity.min(100);
        self
    }

    /// Command for beat `beat` of this effect, counted from the effect's first
    /// beat. `None` on beats inside a span that need no change.
    pub fn command_for(&self, beat: u64, palette: &[Rgb]) -> Option<DeviceCommand> {
        let colors: &[Rgb] = match (self.colors.is_empty(), palette.is_empty()) {
            (false, _) => &self.colors,
            (true, false) => palette,
            (true, true) => &[Rgb::WHITE],
        };
        let pick = |n: u64| colors[(n % colors.len() as u64) as usize];

        let span = u64::from(self.span.max(1));
        let cycle = beat / span;
        let step = beat % span;
        let intensity = self.intensity.min(100);

        let command = match self.kind {
            EffectKind::Strobe => {
                let first = colors[0];
                let second = colors.get(1).copied().unwrap_or(Rgb::BLACK);
                let color = if beat % 2 == 0 { first } else { second };
                DeviceCommand::Color {
                    color,
                    brightness: intensity,
                }
            }
            EffectKind::Swell => DeviceCommand::Color {
                color: pick(cycle),
                brightness: scale(intensity, (step + 1) as f32 / span as f32),
            },
            EffectKind::Fade => DeviceCommand::Color {
                color: pick(cycle),
                brightness: scale(intensity, (span - step) as f32 / span as f32),
            },
            EffectKind::Transition => DeviceCommand::Color {
                color: pick(cycle).lerp(pick(cycle + 1), step as f32 / span as f32),
                brightness: intensity,
            },
            EffectKind::Switch => {
                if step != 0 {
                    return None;
                }
                DeviceCommand::Color {
                    color: pick(cycle),
                    brightness: intensity,
                }
            }
            EffectKind::Pulse => DeviceCommand::Effect {
                name: FLASH_EFFECT.to_string(),
                speed: intensity,
            },
        };

        Some(command)
    }
}

impl fmt::Display for EffectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} every {} beat(s)", self.kind, self.span)?;
        if !self.colors.is_empty() {
            let colors: Vec<String> = self.colors.iter().map(|color| color.to_hex()).collect();
            write!(f, " [{}]", colors.join(", "))?;
        }
        Ok(())
    }
}

fn scale(intensity: u8, fraction: f32) -> u8 {
    (f32::from(intensity) * fraction.clamp(0.0, 1.0)).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = Rgb::new(255, 0, 0);
    const BLUE: Rgb = Rgb::new(0, 0, 255);

    fn colors_of(spec: &EffectSpec, beats: u64, palette: &[Rgb]) -> Vec<(Rgb, u8)> {
        (0..beats)
            .filter_map(|beat| match spec.command_for(beat, palette)? {
                DeviceCommand::Color { color, brightness } => Some((color, brightness)),
                other => panic!("unexpected command {other:?}"),
            })
            .collect()
    }

    #[test]
    fn strobe_alternates_two_colors_every_beat() {
        let spec = EffectSpec::new(EffectKind::Strobe).with_colors(vec![RED, BLUE]);
        let sent = colors_of(&spec, 6, &[]);
        assert_eq!(sent.len(), 6);
        for (beat, (color, _)) in sent.iter().enumerate() {
            let expected = if beat % 2 == 0 { RED } else { BLUE };
            assert_eq!(*color, expected);
        }
    }

    #[test]
    fn single_color_strobe_blinks_to_black() {
        let spec = EffectSpec::new(EffectKind::Strobe).with_colors(vec![Rgb::WHITE]);
        let sent = colors_of(&spec, 2, &[]);
        assert_eq!(sent[0].0, Rgb::WHITE);
        assert_eq!(sent[1].0, Rgb::BLACK);
    }

    #[test]
    fn swell_ramps_brightness_over_span() {
        let spec = EffectSpec::new(EffectKind::Swell).with_colors(vec![RED, BLUE]);
        let sent = colors_of(&spec, 8, &[]);
        let brightness: Vec<u8> = sent.iter().map(|(_, b)| *b).collect();
        assert_eq!(brightness, vec![25, 50, 75, 100, 25, 50, 75, 100]);
        assert_eq!(sent[3].0, RED);
        assert_eq!(sent[4].0, BLUE);
    }

    #[test]
    fn fade_decays_brightness_over_span() {
        let spec = EffectSpec::new(EffectKind::Fade).with_intensity(80);
        let sent = colors_of(&spec, 4, &[RED]);
        let brightness: Vec<u8> = sent.iter().map(|(_, b)| *b).collect();
        assert_eq!(brightness, vec![80, 40, 80, 40]);
    }

    #[test]
    fn transition_interpolates_towards_next_color() {
        let spec = EffectSpec::new(EffectKind::Transition).with_span(2);
        let sent = colors_of(&spec, 3, &[Rgb::BLACK, Rgb::new(200, 100, 0)]);
        assert_eq!(sent[0].0, Rgb::BLACK);
        assert_eq!(sent[1].0, Rgb::new(100, 50, 0));
        assert_eq!(sent[2].0, Rgb::new(200, 100, 0));
    }

    #[test]
    fn switch_emits_once_per_span() {
        let spec = EffectSpec::new(EffectKind::Switch).with_span(4);
        let emitted: Vec<u64> = (0..12)
            .filter(|beat| spec.command_for(*beat, &[RED, BLUE]).is_some())
            .collect();
        assert_eq!(emitted, vec![0, 4, 8]);
    }

    #[test]
    fn pulse_uses_flash_preset() {
        let spec = EffectSpec::new(EffectKind::Pulse);
        assert_eq!(
            spec.command_for(5, &[]),
            Some(DeviceCommand::Effect {
                name: FLASH_EFFECT.into(),
                speed: 100
            })
        );
    }

    #[test]
    fn parses_effect_names() {
        assert_eq!("Swell".parse::<EffectKind>().unwrap(), EffectKind::Swell);
        assert_eq!("beat".parse::<EffectKind>().unwrap(), EffectKind::Pulse);
        assert!("wobble".parse::<EffectKind>().is_err());
    }
}
