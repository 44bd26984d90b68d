// Audio visualizer - spectrum of the system audio spread over the segments
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{RunContext, Visualizer};
use crate::audio::AudioSource;
use crate::spectrum::SpectrumAnalyzer;

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct AudioVisualizer {
    source: Arc<dyn AudioSource>,
    analyzer: Arc<Mutex<SpectrumAnalyzer>>,
    retry_delay: Duration,
}

impl AudioVisualizer {
    pub fn new(source: Arc<dyn AudioSource>, analyzer: SpectrumAnalyzer) -> Self {
        AudioVisualizer {
            source,
            analyzer: Arc::new(Mutex::new(analyzer)),
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Analyze one buffer unless a pass is already running, in which case it is dropped
fn spawn_analysis(ctx: &RunContext, analyzer: &Arc<Mutex<SpectrumAnalyzer>>, samples: Vec<f32>) {
    let analyzer = Arc::clone(analyzer);
    let ctx2 = ctx.clone();
    ctx.tracker.spawn(async move {
        let update = tokio::task::spawn_blocking(move || {
            let mut analyzer = analyzer.try_lock().ok()?;
            Some(analyzer.analyze(&samples))
        })
        .await;
        match update {
            Ok(Some(update)) => {
                ctx2.emit(update).await;
            }
            Ok(None) => debug!("Audio buffer dropped, analysis busy"),
            Err(e) => warn!("Audio analysis failed: {}", e),
        }
    });
}

impl Visualizer for AudioVisualizer {
    fn name(&self) -> &'static str {
        "audioviz"
    }

    fn spawn(&self, ctx: RunContext) {
        match self.analyzer.lock() {
            Ok(mut analyzer) => analyzer.reset(),
            Err(poisoned) => poisoned.into_inner().reset(),
        }

        let source = Arc::clone(&self.source);
        let analyzer = Arc::clone(&self.analyzer);
        let retry_delay = self.retry_delay;

        ctx.tracker.clone().spawn(async move {
            loop {
                let open_source = Arc::clone(&source);
                let token = ctx.cancel.child_token();
                let opened = tokio::task::spawn_blocking(move || open_source.open(token)).await;

                let mut stream = match opened {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!("Audio capture unavailable: {:#}", e);
                        if !ctx.pause(retry_delay).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!("Audio open task failed: {}", e);
                        break;
                    }
                };
                info!(rate = stream.format.sample_rate, channels = stream.format.channels, "Audio visualizer running");

                loop {
                    let next = tokio::select! {
                        _ = ctx.cancel.cancelled() => None,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(samples)) => spawn_analysis(&ctx, &analyzer, samples),
                        Some(Err(e)) => {
                            warn!("Audio capture lost: {:#}", e);
                            break;
                        }
                        None => break,
                    }
                }
                stream.close().await;

                if ctx.cancel.is_cancelled() || !ctx.pause(retry_delay).await {
                    break;
                }
            }
        });
    }
}
