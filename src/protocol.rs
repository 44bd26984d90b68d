// Protocol Module - Client/server events, MessagePack maps in length-prefixed frames
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::ProtocolError;
use crate::types::{Segment, SegmentCommand, StripType, UpdateEvent};

const MAX_FRAME_LEN: usize = 1 << 20;

/// Every message is a map carrying at least this field
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    Reload(Reload),
    Ambilight(Ambilight),
    Effect(EffectCommand),
    Clear,
    Connected(Connected),
    SetColor(SetColor),
    TurnOn(SegmentRefs),
    TurnOff(SegmentRefs),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Reload(_) => "reload",
            Event::Ambilight(_) => "ambilight",
            Event::Effect(_) => "effect",
            Event::Clear => "clear",
            Event::Connected(_) => "connected",
            Event::SetColor(_) => "setColor",
            Event::TurnOn(_) => "turnOn",
            Event::TurnOff(_) => "turnOff",
        }
    }
}

const KNOWN_EVENTS: [&str; 8] = [
    "reload",
    "ambilight",
    "effect",
    "clear",
    "connected",
    "setColor",
    "turnOn",
    "turnOff",
];

/// Strip description and segment layout; sent first on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reload {
    pub leds: usize,
    pub strip_type: StripType,
    pub gpio_pin: u8,
    pub brightness: u8,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPixels {
    pub id: u32,
    #[serde(with = "serde_bytes")]
    pub pix: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambilight {
    pub segments: Vec<SegmentPixels>,
}

impl From<UpdateEvent> for Ambilight {
    fn from(update: UpdateEvent) -> Self {
        Ambilight {
            segments: update
                .segments
                .into_iter()
                .map(|u| SegmentPixels { id: u.segment_id, pix: u.pix })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Rainbow,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectCommand {
    pub effect: EffectKind,
    #[serde(default)]
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentColor {
    pub id: u32,
    pub color: [u8; 3],
}

/// Fill whole segments with one color each
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetColor {
    pub segments: Vec<SegmentColor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRefs {
    pub segments: Vec<SegmentRef>,
}

impl From<SegmentCommand> for Event {
    fn from(cmd: SegmentCommand) -> Self {
        let one = |id| SegmentRefs { segments: vec![SegmentRef { id }] };
        match cmd {
            SegmentCommand::On(id) => Event::TurnOn(one(id)),
            SegmentCommand::Off(id) => Event::TurnOff(one(id)),
            SegmentCommand::Color(id, rgb) => Event::SetColor(SetColor {
                segments: vec![SegmentColor { id, color: rgb.to_array() }],
            }),
        }
    }
}

/// Server greeting describing the strip it drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub leds: usize,
    pub strip_type: StripType,
    pub gpio_pin: u8,
    pub brightness: u8,
}

pub fn encode(event: &Event) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(event)?)
}

/// Read the envelope first so unknown events are told apart from malformed ones
pub fn decode(bytes: &[u8]) -> Result<Event, ProtocolError> {
    let envelope: Envelope = rmp_serde::from_slice(bytes)?;
    if !KNOWN_EVENTS.contains(&envelope.event.as_str()) {
        return Err(ProtocolError::UnknownEvent(envelope.event));
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Frames are a 4-byte big-endian length followed by one encoded event
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}
