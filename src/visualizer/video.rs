// Video visualizer - screen border colors for every display of the matching profile
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RunContext, Visualizer};
use crate::capture::{CaptureProvider, Display, Frame, FrameStream};
use crate::config::{DisplayConfig, DisplayProfile, VideoConfig};
use crate::perimeter::{extract_perimeter, segment_colors, Bounds};
use crate::types::{PixelUpdate, UpdateEvent};

pub struct VideoVisualizer {
    provider: Arc<dyn CaptureProvider>,
    profiles: Vec<DisplayProfile>,
    video: VideoConfig,
}

impl VideoVisualizer {
    pub fn new(provider: Arc<dyn CaptureProvider>, profiles: Vec<DisplayProfile>, video: VideoConfig) -> Self {
        VideoVisualizer { provider, profiles, video }
    }
}

fn matches(config: &DisplayConfig, display: &Display) -> bool {
    config.display_id == display.id
        && config.width == display.width
        && config.height == display.height
        && config.left == display.origin_x
        && config.top == display.origin_y
        && config.orientation == display.orientation
}

/// First profile whose every entry is one of the attached displays
pub fn match_profile<'a>(profiles: &'a [DisplayProfile], displays: &[Display]) -> Option<&'a DisplayProfile> {
    profiles
        .iter()
        .find(|p| p.displays.iter().all(|c| displays.iter().any(|d| matches(c, d))))
}

/// Segments fed from one display, with their ring windows
struct Job {
    segment_id: u32,
    leds: usize,
    bounds: Bounds,
}

fn process_frame(frame: &Frame, jobs: &[Job], ring: &mut Vec<u8>, video: &VideoConfig) -> Result<UpdateEvent> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    extract_perimeter(frame.as_raw(), width, height, ring)?;
    let segments = jobs
        .iter()
        .map(|job| PixelUpdate {
            segment_id: job.segment_id,
            pix: segment_colors(ring, job.bounds, job.leds, video.black_point, video.white_point),
        })
        .collect();
    Ok(UpdateEvent { segments })
}

/// Frames flow into a depth-1 slot; the worker always takes the newest one
fn spawn_display(
    ctx: &RunContext,
    disp: Display,
    mut stream: FrameStream,
    jobs: Vec<Job>,
    video: VideoConfig,
) -> [JoinHandle<()>; 2] {
    let (slot_tx, mut slot_rx) = watch::channel::<Option<Arc<Frame>>>(None);

    let cancel = ctx.cancel.clone();
    let forwarder = ctx.tracker.spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };
            match frame {
                Some(frame) => {
                    slot_tx.send_replace(Some(Arc::new(frame)));
                }
                None => break,
            }
        }
        stream.close().await;
        debug!("Display {} frame stream closed", disp.id);
    });

    let ctx = ctx.clone();
    let jobs = Arc::new(jobs);
    let worker = ctx.tracker.clone().spawn(async move {
        let mut ring = Vec::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                changed = slot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let Some(frame) = slot_rx.borrow_and_update().clone() else {
                continue;
            };

            let jobs = Arc::clone(&jobs);
            let video = video.clone();
            let mut buf = std::mem::take(&mut ring);
            let result = tokio::task::spawn_blocking(move || {
                let update = process_frame(&frame, &jobs, &mut buf, &video);
                (buf, update)
            })
            .await;

            let update = match result {
                Ok((buf, update)) => {
                    ring = buf;
                    update
                }
                Err(e) => {
                    warn!("Display {} worker failed: {}", disp.id, e);
                    break;
                }
            };
            match update {
                Ok(update) => {
                    if !ctx.emit(update).await {
                        break;
                    }
                }
                Err(e) => debug!("Display {} frame skipped: {}", disp.id, e),
            }
        }
    });

    [forwarder, worker]
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Display task failed: {}", e);
        }
    }
}

/// Open a stream for every display of the matching profile and wait for all of them to end
async fn run_profile(
    ctx: &RunContext,
    provider: &Arc<dyn CaptureProvider>,
    profiles: &[DisplayProfile],
    video: &VideoConfig,
) -> Result<()> {
    let displays = provider.all()?;
    let profile = match_profile(profiles, &displays).ok_or_else(|| {
        anyhow!("No display profile matches the {} attached display(s)", displays.len())
    })?;

    let mut by_display: BTreeMap<usize, Vec<&DisplayConfig>> = BTreeMap::new();
    for config in &profile.displays {
        by_display.entry(config.display_id).or_default().push(config);
    }

    // Child token so streams of this profile can be torn down without ending the run
    let profile_ctx = RunContext {
        cancel: ctx.cancel.child_token(),
        tracker: ctx.tracker.clone(),
        events: ctx.events.clone(),
    };
    let mut handles = Vec::new();

    for (id, configs) in by_display {
        let Some(display) = displays.iter().find(|d| configs.iter().all(|c| matches(c, d))).copied() else {
            continue;
        };
        let (width, height) = display.frame_size();
        let started = configs
            .iter()
            .map(|c| -> Result<Job> { Ok(Job { segment_id: c.segment_id, leds: c.leds, bounds: c.bounds(width, height)? }) })
            .collect::<Result<Vec<_>>>()
            .and_then(|jobs| {
                let framerate = configs.iter().map(|c| c.framerate).max().unwrap_or(30);
                let stream = provider.capture(&display, profile_ctx.cancel.clone(), framerate)?;
                info!(display = id, width, height, framerate, "Ambilight capture started");
                Ok((stream, jobs))
            });

        match started {
            Ok((stream, jobs)) => handles.extend(spawn_display(&profile_ctx, display, stream, jobs, video.clone())),
            Err(e) => {
                profile_ctx.cancel.cancel();
                join_all(handles).await;
                return Err(e.context(format!("display {}", id)));
            }
        }
    }

    // Finishes when every stream closed on its own or the run was cancelled
    join_all(handles).await;
    profile_ctx.cancel.cancel();
    Ok(())
}

impl Visualizer for VideoVisualizer {
    fn name(&self) -> &'static str {
        "ambilight"
    }

    fn spawn(&self, ctx: RunContext) {
        let provider = Arc::clone(&self.provider);
        let profiles = self.profiles.clone();
        let video = self.video.clone();
        let delay = Duration::from_millis(video.restart_delay_ms);

        ctx.tracker.clone().spawn(async move {
            info!("Ambilight using {} capture", provider.name());
            loop {
                match run_profile(&ctx, &provider, &profiles, &video).await {
                    Ok(()) => debug!("Ambilight streams ended"),
                    Err(e) => warn!("Ambilight capture failed: {:#}", e),
                }
                if ctx.cancel.is_cancelled() || !ctx.pause(delay).await {
                    break;
                }
                debug!("Re-enumerating displays");
            }
        });
    }
}
