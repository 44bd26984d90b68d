// Capture Module - Display enumeration and per-display frame streams
//
// Each backend wraps a narrow OS primitive and runs it on its own thread, ticking at
// the configured framerate and handing frames over a channel.
use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CaptureBackend;

pub mod bitblt;
pub mod duplication;
pub mod pattern;

pub use bitblt::{BlitProvider, Blitter};
pub use duplication::{DuplicationApi, DuplicationProvider, DuplicationSession};
pub use pattern::TestPattern;

/// Packed RGBA, row-major, stride = width * 4
pub type Frame = RgbaImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
    LandscapeFlipped,
    PortraitFlipped,
}

impl Orientation {
    pub fn is_portrait(&self) -> bool {
        matches!(self, Orientation::Portrait | Orientation::PortraitFlipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Display {
    pub id: usize,
    pub width: usize,
    pub height: usize,
    pub origin_x: i32,
    pub origin_y: i32,
    pub orientation: Orientation,
}

impl Display {
    /// Dimensions of the captured buffer. Rotated displays are scanned out in
    /// landscape, so width and height swap for portrait orientations.
    pub fn frame_size(&self) -> (usize, usize) {
        if self.orientation.is_portrait() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// Enumerates displays and opens frame streams on them
pub trait CaptureProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn all(&self) -> Result<Vec<Display>>;

    /// One frame per `1000/framerate` ms until `cancel` fires or capture fails for good
    fn capture(&self, display: &Display, cancel: CancellationToken, framerate: u32) -> Result<FrameStream>;
}

/// Build the provider selected in the configuration
pub fn provider(backend: CaptureBackend) -> Arc<dyn CaptureProvider> {
    let primitive = Arc::new(TestPattern::default());
    match backend {
        CaptureBackend::DesktopDuplication => Arc::new(DuplicationProvider::new(primitive)),
        CaptureBackend::BitBlt => Arc::new(BlitProvider::new(primitive)),
    }
}

/// Receiving end of a capture thread
pub struct FrameStream {
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl FrameStream {
    /// Next frame, or `None` once the stream is closed
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Stop the capture thread and wait for it to release its handles.
    /// Safe to call on a stream that already ended.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    warn!("Capture thread panicked");
                }
            })
            .await;
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What one tick of a capture loop produced
pub(crate) enum Tick {
    Frame(Frame),
    Skip,
    Stop,
}

/// Run `grab` on a dedicated thread once per frame period
pub(crate) fn spawn_ticker<F>(
    name: String,
    framerate: u32,
    cancel: CancellationToken,
    mut grab: F,
) -> Result<FrameStream>
where
    F: FnMut(&CancellationToken) -> Tick + Send + 'static,
{
    let (tx, rx) = mpsc::channel(2);
    let period = Duration::from_millis(1000 / framerate.max(1) as u64);
    let thread_cancel = cancel.clone();

    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        let mut next = Instant::now();
        while !thread_cancel.is_cancelled() {
            match grab(&thread_cancel) {
                Tick::Frame(frame) => {
                    if tx.blocking_send(frame).is_err() {
                        break;
                    }
                }
                Tick::Skip => {}
                Tick::Stop => break,
            }

            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
        debug!("{} finished", name);
    })?;

    Ok(FrameStream { rx, cancel, thread: Some(thread) })
}
