// Server Module - Accepts the client connection and dispatches its events onto the strip
use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{validate_segments, Calibration};
use crate::effects::Effect;
use crate::engine::{RenderEngine, RenderOutcome};
use crate::protocol::{
    self, Ambilight, Connected, EffectCommand, EffectKind, Event, Reload, SegmentRef, SegmentRefs, SetColor,
};
use crate::strip::StripSettings;
use crate::types::{Rgb, Segment};

/// Segment id to the LED range it occupies. The strip is the segments laid
/// end to end by ascending id, whatever order they arrive in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    ranges: HashMap<u32, Range<usize>>,
    // Segments turned off, with the colors to bring back on turnOn
    off: HashMap<u32, Vec<[u8; 4]>>,
}

impl SegmentTable {
    pub fn build(segments: &[Segment]) -> Self {
        let mut sorted = segments.to_vec();
        sorted.sort_by_key(|s| s.id);

        let mut start = 0;
        let ranges = sorted
            .iter()
            .map(|s| {
                let range = start..start + s.leds;
                start += s.leds;
                (s.id, range)
            })
            .collect();
        SegmentTable { ranges, off: HashMap::new() }
    }

    pub fn get(&self, id: u32) -> Option<Range<usize>> {
        self.ranges.get(&id).cloned()
    }

    pub fn is_off(&self, id: u32) -> bool {
        self.off.contains_key(&id)
    }
}

/// Whether the caller should push the buffer to the strip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Render,
    Skip,
}

pub struct Dispatcher {
    engine: Arc<RenderEngine>,
    segments: Mutex<SegmentTable>,
    calibration: Vec<Calibration>,
}

fn scale(c: u8, factor: f32) -> u8 {
    (c as f32 * factor).round().clamp(0.0, 255.0) as u8
}

impl Dispatcher {
    pub fn new(engine: Arc<RenderEngine>, calibration: Vec<Calibration>) -> Self {
        let leds = engine.led_count();
        Dispatcher {
            engine,
            segments: Mutex::new(SegmentTable::build(&[Segment { id: 0, leds }])),
            calibration,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SegmentTable> {
        self.segments.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Greeting describing the strip as currently configured
    pub fn connected(&self) -> Event {
        let s = self.engine.settings();
        Event::Connected(Connected {
            leds: s.leds,
            strip_type: s.strip_type,
            gpio_pin: s.gpio_pin,
            brightness: s.brightness,
        })
    }

    fn calibrate(&self, index: usize, color: [u8; 4]) -> [u8; 4] {
        match self.calibration.iter().find(|c| (c.start..c.end).contains(&index)) {
            Some(c) => [
                scale(color[0], c.red),
                scale(color[1], c.green),
                scale(color[2], c.blue),
                scale(color[3], c.white),
            ],
            None => color,
        }
    }

    /// Decode and apply one message. Blocking: may join the effect thread or reinit the driver.
    pub fn handle(&self, bytes: &[u8]) -> Action {
        let event = match protocol::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return Action::Skip;
            }
        };
        trace!("Received {}", event.name());

        match event {
            Event::Reload(reload) => self.reload(reload),
            Event::Ambilight(update) => self.ambilight(update),
            Event::Effect(cmd) => self.effect(cmd),
            Event::Clear => {
                self.engine.stop_effect();
                if let Err(e) = self.engine.clear() {
                    warn!("Clear failed: {}", e);
                }
                Action::Skip
            }
            Event::SetColor(set) => self.set_color(set),
            Event::TurnOff(refs) => self.turn_off(refs),
            Event::TurnOn(refs) => self.turn_on(refs),
            Event::Connected(_) => {
                debug!("Ignoring connected event from client");
                Action::Skip
            }
        }
    }

    fn lookup(&self, id: u32) -> Option<Range<usize>> {
        let range = self.table().get(id);
        if range.is_none() {
            warn!("Unknown segment {}, dropping", id);
        }
        range
    }

    fn write(&self, id: u32, start: usize, colors: &[[u8; 4]]) -> bool {
        match self.engine.set_leds(start, colors) {
            Ok(()) => true,
            Err(e) => {
                warn!("Segment {} write failed: {}", id, e);
                false
            }
        }
    }

    fn reload(&self, reload: Reload) -> Action {
        if let Err(e) = validate_segments(&reload.segments, reload.leds) {
            warn!("Rejected reload: {:#}", e);
            return Action::Skip;
        }
        let settings = StripSettings {
            leds: reload.leds,
            brightness: reload.brightness,
            gpio_pin: reload.gpio_pin,
            strip_type: reload.strip_type,
        };
        if let Err(e) = self.engine.reinit(settings) {
            warn!("Strip reinit failed: {}", e);
            return Action::Skip;
        }
        *self.table() = SegmentTable::build(&reload.segments);
        info!(
            leds = reload.leds,
            strip = %reload.strip_type,
            segments = reload.segments.len(),
            "Strip reloaded"
        );
        Action::Skip
    }

    fn ambilight(&self, update: Ambilight) -> Action {
        if self.engine.effect_running() {
            self.engine.stop_effect();
        }

        let mut written = false;
        for seg in update.segments {
            let Some(range) = self.lookup(seg.id) else {
                continue;
            };
            if self.table().is_off(seg.id) {
                continue;
            }
            if seg.pix.len() != range.len() * 4 {
                warn!(
                    "Segment {} carries {} bytes, expected {}",
                    seg.id,
                    seg.pix.len(),
                    range.len() * 4
                );
                continue;
            }
            let colors: Vec<[u8; 4]> = seg
                .pix
                .chunks_exact(4)
                .enumerate()
                .map(|(i, px)| self.calibrate(range.start + i, [px[0], px[1], px[2], px[3]]))
                .collect();
            written |= self.write(seg.id, range.start, &colors);
        }

        if written {
            Action::Render
        } else {
            Action::Skip
        }
    }

    fn set_color(&self, set: SetColor) -> Action {
        self.engine.stop_effect();

        let mut written = false;
        for seg in set.segments {
            let Some(range) = self.lookup(seg.id) else {
                continue;
            };
            if self.table().is_off(seg.id) {
                debug!("Segment {} is off, ignoring color", seg.id);
                continue;
            }
            let [r, g, b] = seg.color;
            let colors: Vec<[u8; 4]> = range.clone().map(|i| self.calibrate(i, [r, g, b, 0])).collect();
            written |= self.write(seg.id, range.start, &colors);
        }

        if written {
            Action::Render
        } else {
            Action::Skip
        }
    }

    fn turn_off(&self, refs: SegmentRefs) -> Action {
        self.engine.stop_effect();

        let mut written = false;
        for SegmentRef { id } in refs.segments {
            let Some(range) = self.lookup(id) else {
                continue;
            };
            if self.table().is_off(id) {
                continue;
            }
            let saved = self.engine.snapshot().get(range.clone()).map(<[_]>::to_vec).unwrap_or_default();
            self.table().off.insert(id, saved);
            written |= self.write(id, range.start, &vec![[0; 4]; range.len()]);
        }

        if written {
            Action::Render
        } else {
            Action::Skip
        }
    }

    fn turn_on(&self, refs: SegmentRefs) -> Action {
        let mut written = false;
        for SegmentRef { id } in refs.segments {
            let Some(range) = self.lookup(id) else {
                continue;
            };
            let saved = self.table().off.remove(&id);
            match saved {
                Some(colors) => written |= self.write(id, range.start, &colors),
                None => debug!("Segment {} is already on", id),
            }
        }

        if written {
            Action::Render
        } else {
            Action::Skip
        }
    }

    fn effect(&self, cmd: EffectCommand) -> Action {
        let effect = match cmd.effect {
            EffectKind::Rainbow => Effect::Rainbow,
            EffectKind::Static => {
                let [r, g, b] = cmd.color;
                Effect::Static(Rgb { r, g, b })
            }
        };
        if let Err(e) = self.engine.start_effect(effect) {
            warn!("Failed to start effect: {}", e);
        }
        Action::Skip
    }

    /// Coalesced render; dropped when one is already in flight
    pub fn render(&self) {
        match self.engine.render() {
            Ok(RenderOutcome::Rendered) => {}
            Ok(RenderOutcome::Skipped) => trace!("Render skipped, strip busy"),
            Err(e) => warn!("Render failed: {}", e),
        }
    }

    /// Connection gone: stop effects and blank the strip
    pub fn disconnected(&self) {
        self.engine.stop_effect();
        if let Err(e) = self.engine.clear() {
            warn!("Failed to clear strip: {}", e);
        }
    }
}

async fn serve_connection(socket: TcpStream, dispatcher: &Arc<Dispatcher>, cancel: &CancellationToken) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut conn = Framed::new(socket, protocol::codec());
    conn.send(Bytes::from(protocol::encode(&dispatcher.connected())?)).await?;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = conn.next() => frame,
        };
        let bytes = match frame {
            Some(frame) => frame?.freeze(),
            None => return Ok(()),
        };

        let handler = Arc::clone(dispatcher);
        let action = tokio::task::spawn_blocking(move || handler.handle(&bytes)).await?;
        if action == Action::Render {
            let renderer = Arc::clone(dispatcher);
            tokio::task::spawn_blocking(move || renderer.render());
        }
    }
}

/// Serve clients one at a time until `cancel` fires
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        info!(%peer, "Client connected");
        if let Err(e) = serve_connection(socket, &dispatcher, &cancel).await {
            warn!("Connection from {} failed: {:#}", peer, e);
        }
        info!(%peer, "Client disconnected");

        let d = Arc::clone(&dispatcher);
        if let Err(e) = tokio::task::spawn_blocking(move || d.disconnected()).await {
            warn!("Disconnect cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SegmentPixels;
    use crate::strip::mock::{Recorder, RecordingFactory};
    use crate::types::{SegmentCommand, StripType};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn dispatcher(calibration: Vec<Calibration>) -> (Arc<Dispatcher>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(RecordingFactory(recorder.clone()));
        let settings = StripSettings { leds: 10, brightness: 255, gpio_pin: 18, strip_type: StripType::Grb };
        let engine = Arc::new(RenderEngine::new(factory, settings).unwrap());
        (Arc::new(Dispatcher::new(engine, calibration)), recorder)
    }

    fn reload(segments: Vec<Segment>) -> Vec<u8> {
        let leds = segments.iter().map(|s| s.leds).sum();
        protocol::encode(&Event::Reload(Reload {
            leds,
            strip_type: StripType::Grbw,
            gpio_pin: 12,
            brightness: 200,
            segments,
        }))
        .unwrap()
    }

    fn ambilight(segments: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
        protocol::encode(&Event::Ambilight(Ambilight {
            segments: segments.into_iter().map(|(id, pix)| SegmentPixels { id, pix }).collect(),
        }))
        .unwrap()
    }

    #[test]
    fn test_segment_table() {
        let table = SegmentTable::build(&[Segment { id: 0, leds: 60 }, Segment { id: 1, leds: 40 }]);
        assert_eq!(table.get(0), Some(0..60));
        assert_eq!(table.get(1), Some(60..100));
        assert_eq!(table.get(2), None);

        // Ranges follow ascending id, not arrival order
        let table = SegmentTable::build(&[Segment { id: 1, leds: 40 }, Segment { id: 0, leds: 60 }]);
        assert_eq!(table.get(0), Some(0..60));
        assert_eq!(table.get(1), Some(60..100));
    }

    #[test]
    fn test_reload_reinitializes_strip() {
        let (d, rec) = dispatcher(vec![]);
        let segs = vec![Segment { id: 4, leds: 3 }, Segment { id: 2, leds: 5 }];
        assert_eq!(d.handle(&reload(segs)), Action::Skip);

        assert_eq!(rec.inits.load(Ordering::SeqCst), 2);
        assert_eq!(d.engine.led_count(), 8);
        let s = d.engine.settings();
        assert_eq!((s.gpio_pin, s.brightness, s.strip_type), (12, 200, StripType::Grbw));
        assert_eq!(d.table().get(2), Some(0..5));
        assert_eq!(d.table().get(4), Some(5..8));
    }

    #[test]
    fn test_invalid_reload_is_ignored() {
        let (d, rec) = dispatcher(vec![]);
        let bytes = protocol::encode(&Event::Reload(Reload {
            leds: 10,
            strip_type: StripType::Grb,
            gpio_pin: 18,
            brightness: 255,
            segments: vec![Segment { id: 0, leds: 4 }],
        }))
        .unwrap();
        assert_eq!(d.handle(&bytes), Action::Skip);
        assert_eq!(rec.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ambilight_writes_segments() {
        let (d, rec) = dispatcher(vec![]);
        d.handle(&reload(vec![Segment { id: 0, leds: 2 }, Segment { id: 1, leds: 3 }]));

        let action = d.handle(&ambilight(vec![
            (1, vec![9; 12]),
            (7, vec![1; 4]),   // unknown segment
            (0, vec![5; 4]),   // wrong length
        ]));
        assert_eq!(action, Action::Render);
        d.render();

        let frame = rec.last_frame().unwrap();
        assert_eq!(&frame[..2], &[[0; 4]; 2]);
        assert_eq!(&frame[2..], &[[9; 4]; 3]);
    }

    #[test]
    fn test_nothing_to_render() {
        let (d, _) = dispatcher(vec![]);
        assert_eq!(d.handle(&ambilight(vec![(3, vec![1; 4])])), Action::Skip);
        assert_eq!(d.handle(&[0xc1]), Action::Skip);
    }

    #[test]
    fn test_calibration_scales_range() {
        let cal = Calibration { start: 5, end: 10, red: 0.5, green: 1.0, blue: 0.0, white: 1.0 };
        let (d, rec) = dispatcher(vec![cal]);
        let pix = [200u8, 100, 50, 0].repeat(10);
        assert_eq!(d.handle(&ambilight(vec![(0, pix)])), Action::Render);
        d.render();

        let frame = rec.last_frame().unwrap();
        assert_eq!(frame[4], [200, 100, 50, 0]);
        assert_eq!(frame[5], [100, 100, 0, 0]);
    }

    #[test]
    fn test_ambilight_stops_effect() {
        let (d, _) = dispatcher(vec![]);
        let effect = protocol::encode(&Event::Effect(EffectCommand { effect: EffectKind::Rainbow, color: [0; 3] })).unwrap();
        d.handle(&effect);
        assert!(d.engine.effect_running());

        d.handle(&ambilight(vec![(0, vec![1; 40])]));
        assert!(!d.engine.effect_running());

        d.handle(&effect);
        d.handle(&protocol::encode(&Event::Clear).unwrap());
        assert!(!d.engine.effect_running());
    }

    #[test]
    fn test_set_color_fills_segment() {
        let cal = Calibration { start: 3, end: 5, red: 0.5, green: 1.0, blue: 1.0, white: 1.0 };
        let (d, rec) = dispatcher(vec![cal]);
        d.handle(&reload(vec![Segment { id: 1, leds: 2 }, Segment { id: 0, leds: 3 }]));

        let cmd = protocol::encode(&Event::from(SegmentCommand::Color(1, Rgb { r: 200, g: 10, b: 20 }))).unwrap();
        assert_eq!(d.handle(&cmd), Action::Render);
        d.render();

        let frame = rec.last_frame().unwrap();
        assert_eq!(&frame[..3], &[[0; 4]; 3]);
        assert_eq!(&frame[3..], &[[100, 10, 20, 0]; 2]);

        let unknown = protocol::encode(&Event::from(SegmentCommand::Color(9, Rgb::default()))).unwrap();
        assert_eq!(d.handle(&unknown), Action::Skip);
    }

    #[test]
    fn test_turn_off_then_on_restores_segment() {
        let (d, rec) = dispatcher(vec![]);
        d.handle(&reload(vec![Segment { id: 0, leds: 2 }, Segment { id: 1, leds: 2 }]));
        d.handle(&ambilight(vec![(0, vec![3; 8]), (1, vec![4; 8])]));

        let off = protocol::encode(&Event::from(SegmentCommand::Off(1))).unwrap();
        assert_eq!(d.handle(&off), Action::Render);
        d.render();
        assert_eq!(rec.last_frame().unwrap(), vec![[3; 4], [3; 4], [0; 4], [0; 4]]);

        // An off segment ignores updates; the others keep going
        d.handle(&ambilight(vec![(0, vec![5; 8]), (1, vec![6; 8])]));
        d.render();
        assert_eq!(rec.last_frame().unwrap(), vec![[5; 4], [5; 4], [0; 4], [0; 4]]);
        assert_eq!(d.handle(&off), Action::Skip);

        let on = protocol::encode(&Event::from(SegmentCommand::On(1))).unwrap();
        assert_eq!(d.handle(&on), Action::Render);
        d.render();
        assert_eq!(rec.last_frame().unwrap(), vec![[5; 4], [5; 4], [4; 4], [4; 4]]);
        assert_eq!(d.handle(&on), Action::Skip);
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let (d, rec) = dispatcher(vec![]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, d.clone(), cancel.clone()));

        let mut conn = Framed::new(TcpStream::connect(addr).await.unwrap(), protocol::codec());
        let greeting = conn.next().await.unwrap().unwrap();
        assert!(matches!(protocol::decode(&greeting).unwrap(), Event::Connected(c) if c.leds == 10));

        conn.send(Bytes::from(reload(vec![Segment { id: 0, leds: 4 }]))).await.unwrap();
        conn.send(Bytes::from(ambilight(vec![(0, vec![7; 16])]))).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while rec.last_frame() != Some(vec![[7; 4]; 4]) {
            assert!(tokio::time::Instant::now() < deadline, "frame never rendered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Disconnect blanks the strip
        drop(conn);
        while rec.last_frame() != Some(vec![[0; 4]; 4]) {
            assert!(tokio::time::Instant::now() < deadline, "strip not cleared");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
