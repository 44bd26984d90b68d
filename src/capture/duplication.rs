// Desktop duplication backend - self-healing capture on top of a duplication session
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{spawn_ticker, CaptureProvider, Display, Frame, FrameStream, Tick};
use crate::error::CaptureError;

const MAX_RESET_ATTEMPTS: usize = 20;
const RESET_BACKOFF: Duration = Duration::from_millis(100);

/// OS duplication API: one session per output, torn down and reopened on device loss
pub trait DuplicationApi: Send + Sync + 'static {
    fn outputs(&self) -> Result<Vec<Display>, CaptureError>;

    fn open(&self, display: &Display) -> Result<Box<dyn DuplicationSession>, CaptureError>;
}

pub trait DuplicationSession: Send {
    /// Size of the frames this session produces
    fn frame_size(&self) -> (usize, usize);

    /// Latest desktop image. `NoImageYet` when nothing changed since the last call;
    /// any other error means the session is dead.
    fn acquire(&mut self) -> Result<Frame, CaptureError>;
}

pub struct DuplicationProvider {
    api: Arc<dyn DuplicationApi>,
}

impl DuplicationProvider {
    pub fn new(api: Arc<dyn DuplicationApi>) -> Self {
        DuplicationProvider { api }
    }
}

/// Reopen a session for `display`, bounded attempts with a short fixed pause.
/// A session of a different size means the display changed under us.
fn reopen(
    api: &dyn DuplicationApi,
    disp: &Display,
    cancel: &CancellationToken,
) -> Result<Box<dyn DuplicationSession>, CaptureError> {
    let expected = disp.frame_size();
    let mut last_err = CaptureError::Unavailable("no reset attempted".into());

    for attempt in 1..=MAX_RESET_ATTEMPTS {
        if cancel.is_cancelled() {
            break;
        }
        match api.open(disp) {
            Ok(session) => {
                let size = session.frame_size();
                if size != expected {
                    return Err(CaptureError::GeometryChanged {
                        id: disp.id,
                        old: (expected.0 as u32, expected.1 as u32),
                        new: (size.0 as u32, size.1 as u32),
                    });
                }
                info!("Display {} capture recovered after {} attempt(s)", disp.id, attempt);
                return Ok(session);
            }
            Err(e) => {
                debug!("Display {} reset attempt {} failed: {}", disp.id, attempt, e);
                last_err = e;
                thread::sleep(RESET_BACKOFF);
            }
        }
    }

    Err(last_err)
}

impl CaptureProvider for DuplicationProvider {
    fn name(&self) -> &'static str {
        "desktop-duplication"
    }

    fn all(&self) -> Result<Vec<Display>> {
        Ok(self.api.outputs()?)
    }

    fn capture(&self, display: &Display, cancel: CancellationToken, framerate: u32) -> Result<FrameStream> {
        let mut session = self.api.open(display)?;
        let api = Arc::clone(&self.api);
        let disp = *display;

        spawn_ticker(format!("dup-capture-{}", disp.id), framerate, cancel, move |cancel| {
            match session.acquire() {
                Ok(frame) => Tick::Frame(frame),
                Err(CaptureError::NoImageYet) => Tick::Skip,
                Err(e) => {
                    warn!("Display {} capture lost: {}", disp.id, e);
                    match reopen(api.as_ref(), &disp, cancel) {
                        Ok(fresh) => {
                            session = fresh;
                            Tick::Skip
                        }
                        Err(e) => {
                            warn!("Display {} capture closed: {}", disp.id, e);
                            Tick::Stop
                        }
                    }
                }
            }
        })
    }
}
