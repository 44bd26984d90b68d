// Strip Module - Hardware driver contract and the DDP output driver
use ddp_rs::connection::DDPConnection;
use ddp_rs::protocol::{PixelConfig, ID};
use std::net::UdpSocket;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::types::StripType;

/// Everything a driver needs to bring a strip up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripSettings {
    pub leds: usize,
    pub brightness: u8,
    pub gpio_pin: u8,
    pub strip_type: StripType,
}

/// A live handle on the physical strip
pub trait LedDriver: Send {
    /// Push one full frame of RGBW colors, one entry per LED
    fn render(&mut self, colors: &[[u8; 4]]) -> Result<(), EngineError>;

    /// Release the strip; the handle is not used afterwards
    fn fini(&mut self);
}

/// Creates a driver handle; called again on every reload
pub trait DriverFactory: Send + Sync {
    fn init(&self, settings: &StripSettings) -> Result<Box<dyn LedDriver>, EngineError>;
}

/// Scale a channel by the 0-255 strip brightness
fn dim(c: u8, brightness: u8) -> u8 {
    ((c as u16 * brightness as u16) / 255) as u8
}

/// Pack colors into the strip's wire order, applying brightness
pub fn encode_frame(colors: &[[u8; 4]], strip_type: StripType, brightness: u8) -> Vec<u8> {
    let channels = strip_type.channels();
    let mut frame = vec![0u8; colors.len() * channels];
    for (color, out) in colors.iter().zip(frame.chunks_exact_mut(channels)) {
        let scaled = color.map(|c| dim(c, brightness));
        strip_type.arrange(scaled, out);
    }
    frame
}

/// Streams the strip to a DDP receiver (WLED and friends) on port 4048
pub struct DdpDriver {
    target: String,
    settings: StripSettings,
    conn: DDPConnection,
}

impl DdpDriver {
    pub fn new(target: &str, settings: StripSettings) -> Result<Self, EngineError> {
        let dest_addr = if target.contains(':') {
            target.to_string()
        } else {
            format!("{}:4048", target)
        };
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let conn = DDPConnection::try_new(&dest_addr, PixelConfig::default(), ID::Default, socket)
            .map_err(|e| EngineError::Driver(format!("DDP connect to {}: {}", dest_addr, e)))?;

        info!(
            addr = %dest_addr,
            leds = settings.leds,
            strip = %settings.strip_type,
            output = settings.gpio_pin,
            "DDP driver ready"
        );
        Ok(DdpDriver { target: dest_addr, settings, conn })
    }
}

impl LedDriver for DdpDriver {
    fn render(&mut self, colors: &[[u8; 4]]) -> Result<(), EngineError> {
        let frame = encode_frame(colors, self.settings.strip_type, self.settings.brightness);
        self.conn
            .write(&frame)
            .map_err(|e| EngineError::Driver(format!("Failed to send to {}: {}", self.target, e)))?;
        Ok(())
    }

    fn fini(&mut self) {
        let blank = vec![0u8; self.settings.leds * self.settings.strip_type.channels()];
        if let Err(e) = self.conn.write(&blank) {
            debug!("Final blank frame to {} failed: {}", self.target, e);
        }
    }
}

pub struct DdpFactory {
    pub target: String,
}

impl DriverFactory for DdpFactory {
    fn init(&self, settings: &StripSettings) -> Result<Box<dyn LedDriver>, EngineError> {
        Ok(Box::new(DdpDriver::new(&self.target, *settings)?))
    }
}

/// Accepts frames and drops them; used when no strip is attached
pub struct NullDriver;

impl LedDriver for NullDriver {
    fn render(&mut self, _colors: &[[u8; 4]]) -> Result<(), EngineError> {
        Ok(())
    }

    fn fini(&mut self) {}
}

pub struct NullFactory;

impl DriverFactory for NullFactory {
    fn init(&self, settings: &StripSettings) -> Result<Box<dyn LedDriver>, EngineError> {
        debug!("Null driver for {} LEDs", settings.leds);
        Ok(Box::new(NullDriver))
    }
}
