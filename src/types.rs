// Shared types module - Common types used across client and server
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Operating mode of the client - exactly one visualizer (or none) is active per mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Reset,
    Reload,
    Ambilight,
    AudioViz,
    Rainbow,
    Static,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Reset => "reset",
            Mode::Reload => "reload",
            Mode::Ambilight => "ambilight",
            Mode::AudioViz => "audioviz",
            Mode::Rainbow => "rainbow",
            Mode::Static => "static",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reset" | "off" => Ok(Mode::Reset),
            "reload" => Ok(Mode::Reload),
            "ambilight" | "video" => Ok(Mode::Ambilight),
            "audioviz" | "audio" => Ok(Mode::AudioViz),
            "rainbow" => Ok(Mode::Rainbow),
            "static" => Ok(Mode::Static),
            other => anyhow::bail!("Unknown mode: {}", other),
        }
    }
}

// Physical color order of the LED strip, with or without a white channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripType {
    Rgbw,
    Rbgw,
    Grbw,
    Gbrw,
    Brgw,
    Bgrw,
    Rgb,
    Rbg,
    Grb,
    Gbr,
    Brg,
    Bgr,
}

impl StripType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StripType::Rgbw => "rgbw",
            StripType::Rbgw => "rbgw",
            StripType::Grbw => "grbw",
            StripType::Gbrw => "gbrw",
            StripType::Brgw => "brgw",
            StripType::Bgrw => "bgrw",
            StripType::Rgb => "rgb",
            StripType::Rbg => "rbg",
            StripType::Grb => "grb",
            StripType::Gbr => "gbr",
            StripType::Brg => "brg",
            StripType::Bgr => "bgr",
        }
    }

    pub fn has_white(&self) -> bool {
        self.as_str().len() == 4
    }

    /// Bytes per LED on the wire to the strip
    pub fn channels(&self) -> usize {
        if self.has_white() {
            4
        } else {
            3
        }
    }

    /// Write one RGBW color into `out` in this strip's channel order.
    /// `out` must hold at least `channels()` bytes.
    pub fn arrange(&self, [r, g, b, w]: [u8; 4], out: &mut [u8]) {
        for (slot, ch) in out.iter_mut().zip(self.as_str().bytes()) {
            *slot = match ch {
                b'r' => r,
                b'g' => g,
                b'b' => b,
                _ => w,
            };
        }
    }
}

impl fmt::Display for StripType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StripType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        ALL_STRIP_TYPES
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid strip type: {}", s))
    }
}

const ALL_STRIP_TYPES: [StripType; 12] = [
    StripType::Rgbw,
    StripType::Rbgw,
    StripType::Grbw,
    StripType::Gbrw,
    StripType::Brgw,
    StripType::Bgrw,
    StripType::Rgb,
    StripType::Rbg,
    StripType::Grb,
    StripType::Gbr,
    StripType::Brg,
    StripType::Bgr,
];

// RGB color representation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            anyhow::bail!("Invalid hex color: {}", hex);
        }
        Ok(Rgb {
            r: u8::from_str_radix(&hex[0..2], 16)?,
            g: u8::from_str_radix(&hex[2..4], 16)?,
            b: u8::from_str_radix(&hex[4..6], 16)?,
        })
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

// A contiguous run of LEDs on the strip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    pub leds: usize,
}

/// Control for a single segment, typed on the client's stdin as
/// `on <id>`, `off <id>` or `color <id> <hex>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentCommand {
    On(u32),
    Off(u32),
    Color(u32, Rgb),
}

impl SegmentCommand {
    pub fn segment_id(&self) -> u32 {
        match *self {
            SegmentCommand::On(id) | SegmentCommand::Off(id) | SegmentCommand::Color(id, _) => id,
        }
    }
}

impl FromStr for SegmentCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let id = words
            .next()
            .ok_or_else(|| anyhow::anyhow!("Missing segment id: {}", s.trim()))?
            .parse::<u32>()?;
        let cmd = match verb.as_str() {
            "on" => SegmentCommand::On(id),
            "off" => SegmentCommand::Off(id),
            "color" => {
                let hex = words.next().ok_or_else(|| anyhow::anyhow!("Missing color: {}", s.trim()))?;
                SegmentCommand::Color(id, Rgb::from_hex(hex)?)
            }
            other => anyhow::bail!("Unknown segment command: {}", other),
        };
        if words.next().is_some() {
            anyhow::bail!("Trailing input: {}", s.trim());
        }
        Ok(cmd)
    }
}

/// Colors for one segment, 4 bytes (RGBA) per LED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelUpdate {
    pub segment_id: u32,
    pub pix: Vec<u8>,
}

/// Everything one visualizer pass produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateEvent {
    pub segments: Vec<PixelUpdate>,
}
