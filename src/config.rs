// Config Module - Configuration files and command-line argument parsing
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::capture::Orientation;
use crate::gradients::{Blend, Gradient};
use crate::perimeter::Bounds;
use crate::strip::StripSettings;
use crate::types::{Mode, Rgb, Segment, StripType};

const CONFIG_DIR: &str = "ledctl";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Ambilight and audio visualization for addressable LED strips",
    long_about = "Captures the screen border or system audio on the client, reduces it to per-LED colors\n\
                  and streams them to a server that drives the LED strip."
)]
pub struct Args {
    #[command(subcommand)]
    pub role: Role,

    /// Config file path or name (e.g., --cfg /full/path or --cfg desk for ~/.config/ledctl/desk.toml)
    #[arg(long, global = true)]
    pub cfg: Option<String>,

    /// Quiet mode (warnings and errors only)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Capture and stream colors to a server
    Client {
        /// Start in this mode (ambilight, audioviz, rainbow, static, reset)
        #[arg(short, long)]
        mode: Option<String>,

        /// List audio devices and exit
        #[arg(long)]
        list_audio: bool,

        /// List displays seen by the capture backend and exit
        #[arg(long)]
        list_displays: bool,
    },
    /// Drive the LED strip with colors received from a client
    Server {
        /// Listen address, overrides the config (e.g. 0.0.0.0:4197)
        #[arg(short, long)]
        listen: Option<String>,
    },
}

/// Where the captured screen comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureBackend {
    #[default]
    DesktopDuplication,
    BitBlt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripConfig {
    pub leds: usize,
    pub strip_type: StripType,
    pub gpio_pin: u8,
    pub brightness: u8,
}

impl Default for StripConfig {
    fn default() -> Self {
        StripConfig {
            leds: 100,
            strip_type: StripType::Grb,
            gpio_pin: 18,
            brightness: 255,
        }
    }
}

impl StripConfig {
    pub fn settings(&self) -> StripSettings {
        StripSettings {
            leds: self.leds,
            brightness: self.brightness,
            gpio_pin: self.gpio_pin,
            strip_type: self.strip_type,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=2048).contains(&self.leds) {
            bail!("Strip LED count must be between 1 and 2048, got {}", self.leds);
        }
        if self.gpio_pin > 27 {
            bail!("GPIO pin must be between 0 and 27, got {}", self.gpio_pin);
        }
        Ok(())
    }
}

/// Maps one physical display onto one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub display_id: usize,
    pub segment_id: u32,
    pub leds: usize,
    pub width: usize,
    pub height: usize,
    pub left: i32,
    pub top: i32,
    /// Rotation reported for the display; portrait swaps the captured frame's axes
    pub orientation: Orientation,
    pub framerate: u32,
    /// Border anchor where the LED run starts, as [x, y]
    pub from: [usize; 2],
    /// Border anchor where the LED run ends, as [x, y]
    pub to: [usize; 2],
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            display_id: 0,
            segment_id: 0,
            leds: 100,
            width: 1920,
            height: 1080,
            left: 0,
            top: 0,
            orientation: Orientation::Landscape,
            framerate: 60,
            from: [0, 0],
            to: [0, 0],
        }
    }
}

impl DisplayConfig {
    /// Size of the frames captured from this display, as the border walk sees them
    pub fn frame_size(&self) -> (usize, usize) {
        if self.orientation.is_portrait() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Ring window for a frame of `width`x`height`
    pub fn bounds(&self, width: usize, height: usize) -> Result<Bounds> {
        Bounds::from_anchors(
            width,
            height,
            (self.from[0], self.from[1]),
            (self.to[0], self.to[1]),
        )
    }
}

/// One arrangement of displays; the first profile matching the attached displays wins
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayProfile {
    pub displays: Vec<DisplayConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub black_point: f64,
    pub white_point: f64,
    pub restart_delay_ms: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            black_point: 16.0,
            white_point: 256.0,
            restart_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub device: String,  // Empty means the default output in loopback
    pub colors: Vec<String>,
    pub blend: Blend,
    pub window_size: usize,
    pub black_point: f32,
    pub mirror: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            device: String::new(),
            colors: vec![
                "0000FF".to_string(),
                "00FFFF".to_string(),
                "00FF00".to_string(),
                "FFFF00".to_string(),
                "FF0000".to_string(),
            ],
            blend: Blend::Oklab,
            window_size: 10,
            black_point: 0.0,
            mirror: true,
        }
    }
}

impl AudioConfig {
    pub fn gradient(&self) -> Result<Gradient> {
        Gradient::from_hex_colors(&self.colors, self.blend)
    }

    pub fn device_name(&self) -> Option<String> {
        let name = self.device.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,  // Where this config was loaded from (not serialized)

    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub static_color: String,
    pub capture: CaptureBackend,
    pub strip: StripConfig,
    pub segments: Vec<Segment>,
    pub profiles: Vec<DisplayProfile>,
    pub video: VideoConfig,
    pub audio: AudioConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            config_path: None,
            mode: Mode::Ambilight,
            host: "127.0.0.1".to_string(),
            port: 4197,
            static_color: "FF8000".to_string(),
            capture: CaptureBackend::DesktopDuplication,
            strip: StripConfig::default(),
            segments: vec![Segment { id: 0, leds: 100 }],
            profiles: vec![DisplayProfile { displays: vec![DisplayConfig::default()] }],
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn static_rgb(&self) -> Result<Rgb> {
        Rgb::from_hex(&self.static_color)
    }

    pub fn sanitize(&mut self) {
        self.host = self.host.trim().to_string();
        self.static_color = self.static_color.trim().trim_start_matches('#').to_string();
        self.audio.colors = self
            .audio
            .colors
            .iter()
            .map(|c| c.trim().trim_start_matches('#').to_string())
            .filter(|c| !c.is_empty())
            .collect();
        self.audio.black_point = self.audio.black_point.clamp(0.0, 0.99);
        self.video.black_point = self.video.black_point.clamp(0.0, 255.0);
        self.video.white_point = self.video.white_point.clamp(self.video.black_point, 512.0);
        self.segments.sort_by_key(|s| s.id);
    }

    /// Reject configurations the pipelines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("Server host is empty");
        }
        if self.port == 0 {
            bail!("Server port must be between 1 and 65535");
        }
        self.strip.validate()?;
        validate_segments(&self.segments, self.strip.leds)?;
        self.static_rgb().context("static_color")?;

        if !(1..=1000).contains(&self.audio.window_size) {
            bail!("Audio window size must be between 1 and 1000, got {}", self.audio.window_size);
        }
        self.audio.gradient().context("audio.colors")?;

        if self.profiles.is_empty() {
            bail!("At least one display profile is required");
        }
        for (p, profile) in self.profiles.iter().enumerate() {
            if profile.displays.is_empty() {
                bail!("Display profile {} has no displays", p);
            }
            for d in &profile.displays {
                self.validate_display(d)
                    .with_context(|| format!("profile {} display {}", p, d.display_id))?;
            }
        }
        Ok(())
    }

    fn validate_display(&self, d: &DisplayConfig) -> Result<()> {
        if !(1..=7680).contains(&d.width) {
            bail!("Display width must be between 1 and 7680, got {}", d.width);
        }
        if !(1..=4320).contains(&d.height) {
            bail!("Display height must be between 1 and 4320, got {}", d.height);
        }
        if d.framerate == 0 {
            bail!("Display framerate must be greater than 0");
        }
        let segment = self
            .segments
            .iter()
            .find(|s| s.id == d.segment_id)
            .ok_or_else(|| anyhow!("Segment {} is not configured", d.segment_id))?;
        if segment.leds != d.leds {
            bail!(
                "Display drives {} LEDs but segment {} has {}",
                d.leds,
                segment.id,
                segment.leds
            );
        }
        let (width, height) = d.frame_size();
        d.bounds(width, height)?;
        Ok(())
    }
}

/// Segments must have unique ids, 1..=1024 LEDs each, and add up to the strip
pub fn validate_segments(segments: &[Segment], total_leds: usize) -> Result<()> {
    if segments.is_empty() {
        bail!("No segments configured");
    }
    let mut ids = HashSet::new();
    for s in segments {
        if !ids.insert(s.id) {
            bail!("Duplicate segment id {}", s.id);
        }
        if !(1..=1024).contains(&s.leds) {
            bail!("Segment {} LED count must be between 1 and 1024, got {}", s.id, s.leds);
        }
    }
    let sum: usize = segments.iter().map(|s| s.leds).sum();
    if sum != total_leds {
        bail!("Segments cover {} LEDs but the strip has {}", sum, total_leds);
    }
    Ok(())
}

/// Output driver used by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Ddp,
    Null,
}

/// Per-channel scale factors for a range of LEDs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub start: usize,
    pub end: usize,
    #[serde(default = "full")]
    pub red: f32,
    #[serde(default = "full")]
    pub green: f32,
    #[serde(default = "full")]
    pub blue: f32,
    #[serde(default = "full")]
    pub white: f32,
}

fn full() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    pub host: String,
    pub port: u16,
    pub driver: DriverKind,
    pub ddp_target: String,  // DDP receiver address, port 4048 unless given
    pub strip: StripConfig,
    pub calibration: Vec<Calibration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            config_path: None,
            host: "0.0.0.0".to_string(),
            port: 4197,
            driver: DriverKind::Ddp,
            ddp_target: "led.local".to_string(),
            strip: StripConfig::default(),
            calibration: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sanitize(&mut self) {
        self.host = self.host.trim().to_string();
        self.ddp_target = self.ddp_target.trim().to_string();
        for c in self.calibration.iter_mut() {
            c.red = c.red.clamp(0.0, 1.0);
            c.green = c.green.clamp(0.0, 1.0);
            c.blue = c.blue.clamp(0.0, 1.0);
            c.white = c.white.clamp(0.0, 1.0);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("Listen port must be between 1 and 65535");
        }
        if self.driver == DriverKind::Ddp && self.ddp_target.is_empty() {
            bail!("ddp_target is required for the ddp driver");
        }
        self.strip.validate()?;
        for c in &self.calibration {
            if c.start >= c.end {
                bail!("Calibration range {}..{} is empty", c.start, c.end);
            }
        }
        Ok(())
    }
}

/// Resolve `--cfg`: absolute or relative paths are used as given, bare names live in
/// ~/.config/ledctl/ with a .toml extension
pub fn config_path(cfg_arg: Option<&str>, default_name: &str) -> Result<PathBuf> {
    if let Some(cfg) = cfg_arg {
        let path = PathBuf::from(cfg);
        if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
            return Ok(path);
        }
        let filename = if cfg.ends_with(".toml") {
            cfg.to_string()
        } else {
            format!("{}.toml", cfg)
        };
        return Ok(config_dir()?.join(filename));
    }
    Ok(config_dir()?.join(format!("{}.toml", default_name)))
}

fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .context("Cannot locate home directory")?;
    Ok(PathBuf::from(home).join(".config").join(CONFIG_DIR))
}

/// Common load path for both config files
pub trait ConfigFile: Serialize + DeserializeOwned + Default {
    const DEFAULT_NAME: &'static str;

    fn set_path(&mut self, path: PathBuf);
    fn sanitize(&mut self);
    fn validate(&self) -> Result<()>;

    fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut parsed: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parsed.set_path(path.to_path_buf());
        parsed.sanitize();
        parsed.validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(parsed)
    }

    /// Load the configured file; a missing default file is created with defaults
    fn load_with_path(cfg_arg: Option<&str>) -> Result<Self> {
        let path = config_path(cfg_arg, Self::DEFAULT_NAME)?;
        if !path.exists() && cfg_arg.is_none() {
            let mut config = Self::default();
            config.set_path(path.clone());
            config.save_to(&path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
        }
        Self::load_from(&path)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl ConfigFile for ClientConfig {
    const DEFAULT_NAME: &'static str = "client";

    fn set_path(&mut self, path: PathBuf) {
        self.config_path = Some(path);
    }

    fn sanitize(&mut self) {
        ClientConfig::sanitize(self)
    }

    fn validate(&self) -> Result<()> {
        ClientConfig::validate(self)
    }
}

impl ConfigFile for ServerConfig {
    const DEFAULT_NAME: &'static str = "server";

    fn set_path(&mut self, path: PathBuf) {
        self.config_path = Some(path);
    }

    fn sanitize(&mut self) {
        ServerConfig::sanitize(self)
    }

    fn validate(&self) -> Result<()> {
        ServerConfig::validate(self)
    }
}
