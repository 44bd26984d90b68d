// Visualizer Module - Cancellable task groups that turn a capture source into UpdateEvents
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::types::UpdateEvent;

pub mod audio;
pub mod video;

pub use audio::AudioVisualizer;
pub use video::VideoVisualizer;

const EVENT_QUEUE: usize = 8;

/// Handles a visualizer's tasks need: stop signal, task group and the fan-in sender
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub events: mpsc::Sender<UpdateEvent>,
}

impl RunContext {
    /// Send an update unless the run is being torn down first
    pub async fn emit(&self, update: UpdateEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(update) => sent.is_ok(),
        }
    }

    /// Sleep for `delay`; false when cancelled meanwhile
    pub async fn pause(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

pub trait Visualizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn every task of one run onto `ctx.tracker`. Must not block.
    fn spawn(&self, ctx: RunContext);
}

enum State {
    Idle,
    Running { cancel: CancellationToken, tracker: TaskTracker },
}

/// Idle -> Running -> Idle lifecycle around one visualizer
pub struct VisualizerRunner {
    visualizer: Arc<dyn Visualizer>,
    state: State,
}

impl VisualizerRunner {
    pub fn new(visualizer: Arc<dyn Visualizer>) -> Self {
        VisualizerRunner { visualizer, state: State::Idle }
    }

    pub fn name(&self) -> &'static str {
        self.visualizer.name()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Start a run and return the receiver all of its tasks send into.
    /// The receiver ends once every task has finished.
    pub fn start(&mut self) -> Result<mpsc::Receiver<UpdateEvent>> {
        if self.is_running() {
            bail!("{} visualizer is already running", self.name());
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        self.visualizer.spawn(RunContext {
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            events: tx,
        });
        debug!("{} visualizer started", self.name());

        self.state = State::Running { cancel, tracker };
        Ok(rx)
    }

    /// Cancel the run and wait for every task to exit. No-op when idle.
    pub async fn stop(&mut self) {
        if let State::Running { cancel, tracker } = std::mem::replace(&mut self.state, State::Idle) {
            cancel.cancel();
            tracker.close();
            tracker.wait().await;
            debug!("{} visualizer stopped", self.name());
        }
    }

    pub fn active_tasks(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Running { tracker, .. } => tracker.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelUpdate;
    use std::time::Duration;

    // Emits a numbered update every few ms on two tasks
    struct Counter;

    impl Visualizer for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn spawn(&self, ctx: RunContext) {
            for id in 0..2 {
                let ctx2 = ctx.clone();
                ctx.tracker.spawn(async move {
                    loop {
                        let update = UpdateEvent { segments: vec![PixelUpdate { segment_id: id, pix: vec![0; 4] }] };
                        if !ctx2.emit(update).await || !ctx2.pause(Duration::from_millis(5)).await {
                            break;
                        }
                    }
                });
            }
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut runner = VisualizerRunner::new(Arc::new(Counter));
        assert_eq!(runner.active_tasks(), 0);
        runner.stop().await;

        let mut rx = runner.start().unwrap();
        assert!(runner.start().is_err());
        assert_eq!(runner.active_tasks(), 2);
        assert!(rx.recv().await.is_some());

        runner.stop().await;
        assert_eq!(runner.active_tasks(), 0);
        assert!(!runner.is_running());

        // All senders are gone once the tasks have exited
        while rx.recv().await.is_some() {}

        // Restartable after a stop
        let mut rx = runner.start().unwrap();
        assert!(rx.recv().await.is_some());
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_stop_with_full_queue() {
        let mut runner = VisualizerRunner::new(Arc::new(Counter));
        let _rx = runner.start().unwrap();
        // Nobody reads; tasks are parked on a full channel and must still exit
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(2), runner.stop()).await.unwrap();
    }
}
