use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{BeatLightError, Result};

/// 24-bit color as understood by the device API. Serialised as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(0xff, 0xff, 0xff);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Resolves a `#RRGGBB` literal or a palette name (case-insensitive).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Some(hex) = trimmed.strip_prefix('#') {
            return Self::from_hex(hex).ok_or_else(|| BeatLightError::InvalidColor(input.into()));
        }

        named(trimmed).ok_or_else(|| BeatLightError::InvalidColor(input.into()))
    }

    fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
        Some(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Linear blend towards `other`; `t` is clamped to [0, 1].
    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        Rgb::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Rgb {
    type Err = BeatLightError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Rgb {
    type Error = BeatLightError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_hex()
    }
}

/// Color names accepted wherever a color is expected, tuned for the
/// controller's LEDs rather than sRGB accuracy.
pub const NAMED_COLORS: &[(&str, Rgb)] = &[
    ("white", Rgb::new(0xff, 0xff, 0xff)),
    ("red", Rgb::new(0xff, 0x00, 0x00)),
    ("orange", Rgb::new(0xff, 0x20, 0x00)),
    ("yellow", Rgb::new(0xff, 0x92, 0x00)),
    ("ferngreen", Rgb::new(0xaa, 0xff, 0x00)),
    ("green", Rgb::new(0x00, 0xff, 0x00)),
    ("seagreen", Rgb::new(0x0e, 0xff, 0x1e)),
    ("cyan", Rgb::new(0x00, 0xff, 0xdd)),
    ("lavender", Rgb::new(0x44, 0x33, 0xfa)),
    ("blue", Rgb::new(0x00, 0x00, 0xff)),
    ("violet", Rgb::new(0x99, 0x00, 0xff)),
    ("magenta", Rgb::new(0xfe, 0x00, 0xae)),
    ("pink", Rgb::new(0xff, 0x00, 0x16)),
];

pub fn named(name: &str) -> Option<Rgb> {
    NAMED_COLORS
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, color)| *color)
}

/// Session palette used when an effect does not bring its own colors.
pub fn default_palette() -> Vec<Rgb> {
    vec![Rgb::new(0xfe, 0x00, 0xae), Rgb::new(0x00, 0xff, 0xdd)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_names() {
        assert_eq!(Rgb::parse("#FE00AE").unwrap(), Rgb::new(0xfe, 0x00, 0xae));
        assert_eq!(Rgb::parse("#00ffdd").unwrap(), Rgb::new(0x00, 0xff, 0xdd));
        assert_eq!(Rgb::parse("Cyan").unwrap(), Rgb::parse("#00FFDD").unwrap());
    }

    #[test]
    fn rejects_malformed_colors() {
        for input in ["#12345", "#GG0000", "chartreuse", "", "#1234567"] {
            let err = Rgb::parse(input).unwrap_err();
            assert!(matches!(err, BeatLightError::InvalidColor(_)), "{input}");
        }
    }

    #[test]
    fn formats_as_upper_hex() {
        assert_eq!(Rgb::new(1, 0xab, 0xff).to_string(), "#01ABFF");
    }

    #[test]
    fn lerp_hits_both_ends_and_midpoint() {
        let a = Rgb::BLACK;
        let b = Rgb::new(200, 100, 50);
        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.lerp(b, 1.0), b);
        assert_eq!(a.lerp(b, 0.5), Rgb::new(100, 50, 25));
        assert_eq!(a.lerp(b, 7.0), b);
    }

    #[test]
    fn serde_uses_hex_strings() {
        let json = serde_json::to_string(&vec![Rgb::WHITE]).unwrap();
        assert_eq!(json, r##"["#FFFFFF"]"##);
        let back: Vec<Rgb> = serde_json::from_str(r##"["red", "#0000ff"]"##).unwrap();
        assert_eq!(back, vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)]);
    }
}
