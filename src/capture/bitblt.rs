// BitBlt backend - copies the screen every tick; any failure ends the stream
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{spawn_ticker, CaptureProvider, Display, Frame, FrameStream, Tick};
use crate::error::CaptureError;

/// Screen-to-memory blit primitive
pub trait Blitter: Send + Sync + 'static {
    fn screens(&self) -> Result<Vec<Display>, CaptureError>;

    fn grab(&self, display: &Display) -> Result<Frame, CaptureError>;
}

pub struct BlitProvider {
    blitter: Arc<dyn Blitter>,
}

impl BlitProvider {
    pub fn new(blitter: Arc<dyn Blitter>) -> Self {
        BlitProvider { blitter }
    }
}

impl CaptureProvider for BlitProvider {
    fn name(&self) -> &'static str {
        "bitblt"
    }

    fn all(&self) -> Result<Vec<Display>> {
        Ok(self.blitter.screens()?)
    }

    fn capture(&self, display: &Display, cancel: CancellationToken, framerate: u32) -> Result<FrameStream> {
        let blitter = Arc::clone(&self.blitter);
        let disp = *display;
        let (width, height) = disp.frame_size();

        spawn_ticker(format!("blit-capture-{}", disp.id), framerate, cancel, move |_| {
            match blitter.grab(&disp) {
                Ok(frame) if frame.width() as usize == width && frame.height() as usize == height => {
                    Tick::Frame(frame)
                }
                Ok(frame) => {
                    warn!(
                        "Display {} changed from {}x{} to {}x{}",
                        disp.id,
                        width,
                        height,
                        frame.width(),
                        frame.height()
                    );
                    Tick::Stop
                }
                Err(e) => {
                    warn!("Display {} blit failed: {}", disp.id, e);
                    Tick::Stop
                }
            }
        })
    }
}
