// Controller Module - Owns the active mode and turns it into outbound protocol messages
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::AudioSource;
use crate::capture::CaptureProvider;
use crate::config::ClientConfig;
use crate::protocol::{self, Ambilight, EffectCommand, EffectKind, Event, Reload};
use crate::spectrum::SpectrumAnalyzer;
use crate::types::{Mode, SegmentCommand, UpdateEvent};
use crate::visualizer::{AudioVisualizer, VideoVisualizer, VisualizerRunner};

const OUTBOUND_QUEUE: usize = 32;

fn reload_event(config: &ClientConfig) -> Event {
    Event::Reload(Reload {
        leds: config.strip.leds,
        strip_type: config.strip.strip_type,
        gpio_pin: config.strip.gpio_pin,
        brightness: config.strip.brightness,
        segments: config.segments.clone(),
    })
}

pub struct ModeController {
    config: ClientConfig,
    mode: Option<Mode>,
    provider: Arc<dyn CaptureProvider>,
    audio_source: Arc<dyn AudioSource>,
    ambilight: VisualizerRunner,
    audioviz: VisualizerRunner,
    forwarder: Option<JoinHandle<()>>,
    outbound: mpsc::Sender<Vec<u8>>,
    outbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    reload: watch::Sender<Vec<u8>>,
}

impl ModeController {
    pub fn new(
        config: ClientConfig,
        provider: Arc<dyn CaptureProvider>,
        audio_source: Arc<dyn AudioSource>,
    ) -> Result<Self> {
        let (ambilight, audioviz) = build_runners(&config, &provider, &audio_source)?;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (reload, _) = watch::channel(protocol::encode(&reload_event(&config))?);

        Ok(ModeController {
            config,
            mode: None,
            provider,
            audio_source,
            ambilight,
            audioviz,
            forwarder: None,
            outbound,
            outbound_rx: Some(outbound_rx),
            reload,
        })
    }

    /// Encoded outbound messages; can be taken once
    pub fn events(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.outbound_rx.take()
    }

    /// Latest encoded Reload message, sent first on every new connection
    pub fn reload_message(&self) -> watch::Receiver<Vec<u8>> {
        self.reload.subscribe()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Tasks still alive across both visualizers
    pub fn active_tasks(&self) -> usize {
        self.ambilight.active_tasks() + self.audioviz.active_tasks()
    }

    pub async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if mode == Mode::Reload {
            return self.reload().await;
        }
        if self.mode == Some(mode) {
            debug!("Already in {} mode", mode);
            return Ok(());
        }

        self.stop_active().await;
        info!("Switching to {} mode", mode);
        self.mode = Some(mode);
        self.start_mode().await
    }

    /// Re-send the strip layout and restart whatever mode was active
    pub async fn reload(&mut self) -> Result<()> {
        self.stop_active().await;
        let bytes = protocol::encode(&reload_event(&self.config))?;
        self.reload.send_replace(bytes.clone());
        self.send(bytes).await;
        info!("Reloaded {} LEDs in {} segment(s)", self.config.strip.leds, self.config.segments.len());
        self.start_mode().await
    }

    /// Swap in a new configuration: a change of mode alone switches modes,
    /// anything else rebuilds the visualizers and reloads
    pub async fn apply_config(&mut self, config: ClientConfig) -> Result<()> {
        let mut same_mode = config.clone();
        same_mode.mode = self.config.mode;
        same_mode.config_path = self.config.config_path.clone();

        if same_mode == self.config {
            let mode = config.mode;
            self.config = config;
            return self.set_mode(mode).await;
        }

        self.stop_active().await;
        let (ambilight, audioviz) = build_runners(&config, &self.provider, &self.audio_source)?;
        self.ambilight = ambilight;
        self.audioviz = audioviz;
        if config.mode != self.config.mode {
            self.mode = Some(config.mode);
        }
        self.config = config;
        self.reload().await
    }

    /// Stop everything and blank the strip
    /// Send a per-segment control straight to the server; the active mode keeps running
    pub async fn segment(&self, cmd: SegmentCommand) -> Result<()> {
        let id = cmd.segment_id();
        if !self.config.segments.iter().any(|s| s.id == id) {
            bail!("Segment {} is not configured", id);
        }
        self.send_event(&Event::from(cmd)).await
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.set_mode(Mode::Reset).await {
            warn!("Failed to reset strip: {:#}", e);
        }
        self.stop_active().await;
    }

    async fn start_mode(&mut self) -> Result<()> {
        let Some(mode) = self.mode else {
            return Ok(());
        };
        match mode {
            Mode::Ambilight => {
                let updates = self.ambilight.start()?;
                self.forward(updates);
            }
            Mode::AudioViz => {
                let updates = self.audioviz.start()?;
                self.forward(updates);
            }
            Mode::Rainbow => {
                let effect = EffectCommand { effect: EffectKind::Rainbow, color: [0; 3] };
                self.send_event(&Event::Effect(effect)).await?;
            }
            Mode::Static => {
                let color = self.config.static_rgb()?.to_array();
                let effect = EffectCommand { effect: EffectKind::Static, color };
                self.send_event(&Event::Effect(effect)).await?;
            }
            Mode::Reset => self.send_event(&Event::Clear).await?,
            Mode::Reload => {}
        }
        Ok(())
    }

    /// Stop both visualizers and wait until the forwarder has passed on its last update
    async fn stop_active(&mut self) {
        self.ambilight.stop().await;
        self.audioviz.stop().await;
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!("Update forwarder failed: {}", e);
            }
        }
    }

    fn forward(&mut self, mut updates: mpsc::Receiver<UpdateEvent>) {
        let outbound = self.outbound.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                match protocol::encode(&Event::Ambilight(Ambilight::from(update))) {
                    Ok(bytes) => {
                        if outbound.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode update: {}", e),
                }
            }
        }));
    }

    async fn send_event(&self, event: &Event) -> Result<()> {
        let bytes = protocol::encode(event).with_context(|| format!("encoding {}", event.name()))?;
        self.send(bytes).await;
        Ok(())
    }

    async fn send(&self, bytes: Vec<u8>) {
        if self.outbound.send(bytes).await.is_err() {
            debug!("Outbound channel closed");
        }
    }
}

fn build_runners(
    config: &ClientConfig,
    provider: &Arc<dyn CaptureProvider>,
    audio_source: &Arc<dyn AudioSource>,
) -> Result<(VisualizerRunner, VisualizerRunner)> {
    let video = VideoVisualizer::new(Arc::clone(provider), config.profiles.clone(), config.video.clone());
    let analyzer = SpectrumAnalyzer::new(
        config.audio.gradient()?,
        config.segments.clone(),
        config.audio.window_size,
        config.audio.black_point,
        config.audio.mirror,
    );
    let audio = AudioVisualizer::new(Arc::clone(audio_source), analyzer);
    Ok((VisualizerRunner::new(Arc::new(video)), VisualizerRunner::new(Arc::new(audio))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioStream;
    use crate::capture::{DuplicationProvider, Display, Orientation, TestPattern};
    use crate::config::{DisplayConfig, DisplayProfile};
    use crate::types::Segment;
    use anyhow::anyhow;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NoAudio;

    impl AudioSource for NoAudio {
        fn open(&self, _cancel: CancellationToken) -> Result<AudioStream> {
            Err(anyhow!("no audio in tests"))
        }
    }

    fn config() -> ClientConfig {
        let mut cfg = ClientConfig::default();
        cfg.strip.leds = 8;
        cfg.segments = vec![Segment { id: 0, leds: 8 }];
        cfg.profiles = vec![DisplayProfile {
            displays: vec![DisplayConfig { leds: 8, width: 16, height: 8, framerate: 100, ..DisplayConfig::default() }],
        }];
        cfg
    }

    fn controller(cfg: ClientConfig) -> (ModeController, mpsc::Receiver<Vec<u8>>) {
        let pattern = TestPattern::new(vec![Display {
            id: 0,
            width: 16,
            height: 8,
            origin_x: 0,
            origin_y: 0,
            orientation: Orientation::Landscape,
        }]);
        let provider: Arc<dyn CaptureProvider> = Arc::new(DuplicationProvider::new(Arc::new(pattern)));
        let mut ctl = ModeController::new(cfg, provider, Arc::new(NoAudio)).unwrap();
        let rx = ctl.events().unwrap();
        (ctl, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            events.push(protocol::decode(&bytes).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_switch_waits_for_visualizer_before_effect() {
        let (mut ctl, mut rx) = controller(config());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(bytes) = rx.recv().await {
                let event = protocol::decode(&bytes).unwrap();
                let _ = seen_tx.send(event.name());
                events.push(event);
            }
            events
        });

        ctl.set_mode(Mode::Ambilight).await.unwrap();
        for _ in 0..3 {
            let name = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
            assert_eq!(name, "ambilight");
        }

        ctl.set_mode(Mode::Rainbow).await.unwrap();
        assert_eq!(ctl.active_tasks(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(ctl);
        let events = reader.await.unwrap();
        // The effect comes after every update of the stopped visualizer
        let last = events.last().unwrap();
        assert!(matches!(last, Event::Effect(EffectCommand { effect: EffectKind::Rainbow, .. })));
        assert!(events[..events.len() - 1].iter().all(|e| matches!(e, Event::Ambilight(_))));
    }

    #[tokio::test]
    async fn test_same_mode_is_noop() {
        let (mut ctl, mut rx) = controller(config());
        ctl.set_mode(Mode::Reset).await.unwrap();
        assert_eq!(drain(&mut rx), vec![Event::Clear]);

        ctl.set_mode(Mode::Reset).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_reload_is_transient() {
        let (mut ctl, mut rx) = controller(config());
        ctl.set_mode(Mode::Static).await.unwrap();
        drain(&mut rx);

        ctl.set_mode(Mode::Reload).await.unwrap();
        assert_eq!(ctl.mode(), Some(Mode::Static));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Reload(r) if r.leds == 8));
        assert_eq!(
            events[1],
            Event::Effect(EffectCommand { effect: EffectKind::Static, color: [0xFF, 0x80, 0x00] })
        );
    }

    #[tokio::test]
    async fn test_apply_config() {
        let (mut ctl, mut rx) = controller(config());
        ctl.set_mode(Mode::Rainbow).await.unwrap();
        drain(&mut rx);

        // Mode only
        let mut cfg = config();
        cfg.mode = Mode::Reset;
        ctl.apply_config(cfg.clone()).await.unwrap();
        assert_eq!(drain(&mut rx), vec![Event::Clear]);

        // Layout change reloads and keeps the mode
        cfg.strip.brightness = 100;
        ctl.apply_config(cfg).await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], Event::Reload(r) if r.brightness == 100));
        assert_eq!(events[1], Event::Clear);

        let latest = protocol::decode(&ctl.reload_message().borrow()).unwrap();
        assert!(matches!(latest, Event::Reload(r) if r.brightness == 100));
    }

    #[tokio::test]
    async fn test_segment_command_is_forwarded() {
        let (ctl, mut rx) = controller(config());
        ctl.segment(SegmentCommand::Off(0)).await.unwrap();
        assert_eq!(drain(&mut rx), vec![Event::from(SegmentCommand::Off(0))]);

        assert!(ctl.segment(SegmentCommand::On(5)).await.is_err());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(ctl.mode(), None);
    }
}
