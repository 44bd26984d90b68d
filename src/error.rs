// Error Module - Typed errors for the render engine, capture backends and wire protocol
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid led index {index} (strip has {len} LEDs)")]
    OutOfRange { index: usize, len: usize },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Nothing new on screen since the last grab; the tick is skipped
    #[error("No image available yet")]
    NoImageYet,

    #[error("Capture device lost: {0}")]
    DeviceLost(String),

    #[error("Display {id} geometry changed from {old:?} to {new:?}")]
    GeometryChanged {
        id: usize,
        old: (u32, u32),
        new: (u32, u32),
    },

    #[error("Capture unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Unknown event type '{0}'")]
    UnknownEvent(String),
}
