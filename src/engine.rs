// Engine Module - LED buffer, coalesced rendering and effect lifecycle
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::effects::{self, Effect};
use crate::error::EngineError;
use crate::strip::{DriverFactory, LedDriver, StripSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered,
    /// Another render was already in flight; this request was dropped
    Skipped,
}

// Driver handle plus a generation counter bumped on every reinit, so a render that
// finishes after a reinit hands back a stale handle instead of reinstalling it
struct DriverSlot {
    generation: u64,
    driver: Option<Box<dyn LedDriver>>,
}

struct EffectHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

// Whether a render is talking to the driver; waiters park on the condvar
#[derive(Default)]
struct RenderGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl RenderGate {
    fn try_enter(&self) -> Option<RenderingGuard<'_>> {
        let mut busy = lock(&self.busy);
        if *busy {
            return None;
        }
        *busy = true;
        Some(RenderingGuard(self))
    }

    fn enter(&self) -> RenderingGuard<'_> {
        let mut busy = self
            .idle
            .wait_while(lock(&self.busy), |busy| *busy)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *busy = true;
        RenderingGuard(self)
    }
}

// Clears the in-flight flag when a render returns, including on error
struct RenderingGuard<'a>(&'a RenderGate);

impl Drop for RenderingGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.busy) = false;
        self.0.idle.notify_one();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RenderEngine {
    factory: Arc<dyn DriverFactory>,
    settings: Mutex<StripSettings>,
    leds: Mutex<Vec<[u8; 4]>>,
    driver: Mutex<DriverSlot>,
    rendering: RenderGate,
    effect: Mutex<Option<EffectHandle>>,
}

impl RenderEngine {
    pub fn new(factory: Arc<dyn DriverFactory>, settings: StripSettings) -> Result<Self, EngineError> {
        let driver = factory.init(&settings)?;
        Ok(RenderEngine {
            factory,
            settings: Mutex::new(settings),
            leds: Mutex::new(vec![[0; 4]; settings.leds]),
            driver: Mutex::new(DriverSlot { generation: 0, driver: Some(driver) }),
            rendering: RenderGate::default(),
            effect: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> StripSettings {
        *lock(&self.settings)
    }

    pub fn led_count(&self) -> usize {
        lock(&self.leds).len()
    }

    pub fn set_led_color(&self, index: usize, color: [u8; 4]) -> Result<(), EngineError> {
        let mut leds = lock(&self.leds);
        let len = leds.len();
        let slot = leds.get_mut(index).ok_or(EngineError::OutOfRange { index, len })?;
        *slot = color;
        Ok(())
    }

    /// Write a run of colors starting at `start`; the whole run must fit the strip
    pub fn set_leds(&self, start: usize, colors: &[[u8; 4]]) -> Result<(), EngineError> {
        let mut leds = lock(&self.leds);
        let len = leds.len();
        let end = start + colors.len();
        if end > len {
            return Err(EngineError::OutOfRange { index: end - 1, len });
        }
        leds[start..end].copy_from_slice(colors);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<[u8; 4]> {
        lock(&self.leds).clone()
    }

    /// Push the buffer to the driver unless a render is already running.
    ///
    /// The buffer is copied under its lock and sent with no lock held, so writes
    /// for the next frame proceed while the strip updates.
    pub fn render(&self) -> Result<RenderOutcome, EngineError> {
        let Some(_guard) = self.rendering.try_enter() else {
            return Ok(RenderOutcome::Skipped);
        };
        self.push_snapshot()?;
        Ok(RenderOutcome::Rendered)
    }

    /// Like `render`, but waits for an in-flight render instead of skipping
    pub fn render_wait(&self) -> Result<(), EngineError> {
        let _guard = self.rendering.enter();
        self.push_snapshot()
    }

    fn push_snapshot(&self) -> Result<(), EngineError> {
        let snapshot = self.snapshot();

        let (generation, driver) = {
            let mut slot = lock(&self.driver);
            (slot.generation, slot.driver.take())
        };
        let mut driver = driver.ok_or_else(|| EngineError::Driver("Strip is not initialized".into()))?;

        let result = driver.render(&snapshot);

        let stale = {
            let mut slot = lock(&self.driver);
            if slot.generation == generation && slot.driver.is_none() {
                slot.driver = Some(driver);
                None
            } else {
                Some(driver)
            }
        };
        if let Some(mut old) = stale {
            old.fini();
        }

        result
    }

    /// Zero the buffer and render it once
    pub fn clear(&self) -> Result<(), EngineError> {
        lock(&self.leds).iter_mut().for_each(|c| *c = [0; 4]);
        self.render_wait()
    }

    /// Tear the driver down and bring it back up with new strip settings
    pub fn reinit(&self, settings: StripSettings) -> Result<(), EngineError> {
        self.stop_effect();

        let old = {
            let mut slot = lock(&self.driver);
            slot.generation += 1;
            slot.driver.take()
        };
        if let Some(mut old) = old {
            old.fini();
        }

        *lock(&self.leds) = vec![[0; 4]; settings.leds];
        *lock(&self.settings) = settings;

        let driver = self.factory.init(&settings)?;
        lock(&self.driver).driver = Some(driver);
        debug!("Strip reinitialized with {} LEDs", settings.leds);
        Ok(())
    }

    /// Replace any running effect with `effect`
    pub fn start_effect(self: &Arc<Self>, effect: Effect) -> Result<(), EngineError> {
        self.stop_effect();

        let cancel = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(self);
        let cancel_clone = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name("led-effect".into())
            .spawn(move || effects::run(effect, &engine, &cancel_clone))?;

        *lock(&self.effect) = Some(EffectHandle { cancel, thread });
        Ok(())
    }

    /// Signal the running effect and wait for its thread to exit
    pub fn stop_effect(&self) {
        let handle = lock(&self.effect).take();
        if let Some(handle) = handle {
            handle.cancel.store(true, Ordering::Relaxed);
            if handle.thread.join().is_err() {
                warn!("Effect thread panicked");
            }
        }
    }

    pub fn effect_running(&self) -> bool {
        lock(&self.effect).is_some()
    }

    /// Stop effects, blank the strip and release the driver
    pub fn fini(&self) {
        self.stop_effect();
        if let Err(e) = self.clear() {
            warn!("Failed to clear strip: {}", e);
        }
        let driver = lock(&self.driver).driver.take();
        if let Some(mut driver) = driver {
            driver.fini();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strip::mock::{Recorder, RecordingFactory};
    use crate::types::{Rgb, StripType};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn settings(leds: usize) -> StripSettings {
        StripSettings { leds, brightness: 255, gpio_pin: 18, strip_type: StripType::Grb }
    }

    fn engine(leds: usize) -> (Arc<RenderEngine>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(RecordingFactory(recorder.clone()));
        let engine = RenderEngine::new(factory, settings(leds)).unwrap();
        (Arc::new(engine), recorder)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_set_led_color_bounds() {
        let (engine, _) = engine(3);
        engine.set_led_color(2, [1, 2, 3, 4]).unwrap();
        match engine.set_led_color(3, [0; 4]) {
            Err(EngineError::OutOfRange { index: 3, len: 3 }) => {}
            other => panic!("expected out of range, got {:?}", other),
        }
        assert!(engine.set_leds(2, &[[0; 4], [0; 4]]).is_err());
        assert_eq!(engine.snapshot()[2], [1, 2, 3, 4]);
    }

    #[test]
    fn test_render_pushes_snapshot() {
        let (engine, rec) = engine(2);
        engine.set_leds(0, &[[9, 9, 9, 0], [7, 7, 7, 0]]).unwrap();
        assert_eq!(engine.render().unwrap(), RenderOutcome::Rendered);
        assert_eq!(rec.last_frame().unwrap(), vec![[9, 9, 9, 0], [7, 7, 7, 0]]);
    }

    #[test]
    fn test_concurrent_render_is_coalesced() {
        let (engine, rec) = engine(4);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *rec.gate.lock().unwrap() = Some((entered_tx, release_rx));

        let first = {
            let engine = engine.clone();
            thread::spawn(move || engine.render())
        };
        entered_rx.recv().unwrap();

        // The first render is parked inside the driver
        let started = Instant::now();
        assert_eq!(engine.render().unwrap(), RenderOutcome::Skipped);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Buffer writes are not blocked by the in-flight render
        engine.set_led_color(0, [1, 1, 1, 1]).unwrap();

        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap().unwrap(), RenderOutcome::Rendered);
        assert_eq!(rec.frame_count(), 1);
        assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_waits_for_in_flight_render() {
        let (engine, rec) = engine(2);
        engine.set_leds(0, &[[8; 4], [8; 4]]).unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *rec.gate.lock().unwrap() = Some((entered_tx, release_rx));

        let first = {
            let engine = engine.clone();
            thread::spawn(move || engine.render())
        };
        entered_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let clearing = {
            let engine = engine.clone();
            thread::spawn(move || {
                let result = engine.clear();
                done_tx.send(()).unwrap();
                result
            })
        };
        // Parked behind the first render instead of skipping it
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        // Let the clear's own render through the gate
        drop(release_tx);
        first.join().unwrap().unwrap();
        clearing.join().unwrap().unwrap();
        assert_eq!(rec.frame_count(), 2);
        assert_eq!(rec.last_frame().unwrap(), vec![[0; 4]; 2]);
        assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_zeroes_and_renders() {
        let (engine, rec) = engine(2);
        engine.set_led_color(1, [5, 5, 5, 5]).unwrap();
        engine.clear().unwrap();
        assert_eq!(rec.last_frame().unwrap(), vec![[0; 4]; 2]);
    }

    #[test]
    fn test_reinit_recreates_driver() {
        let (engine, rec) = engine(2);
        engine.reinit(StripSettings { leds: 5, brightness: 40, gpio_pin: 12, strip_type: StripType::Rgbw }).unwrap();

        assert_eq!(rec.inits.load(Ordering::SeqCst), 2);
        assert_eq!(rec.finis.load(Ordering::SeqCst), 1);
        assert_eq!(engine.led_count(), 5);
        assert_eq!(engine.settings().gpio_pin, 12);
        assert_eq!(rec.settings.lock().unwrap()[1].brightness, 40);
    }

    #[test]
    fn test_rainbow_effect_stops_promptly() {
        let (engine, rec) = engine(16);
        engine.start_effect(Effect::Rainbow).unwrap();
        wait_for(|| rec.frame_count() >= 3);

        engine.stop_effect();
        assert!(!engine.effect_running());
        let frames = rec.frame_count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rec.frame_count(), frames);

        // Consecutive LEDs walk the color wheel
        let frame = rec.last_frame().unwrap();
        assert_ne!(frame[0], frame[1]);
    }

    #[test]
    fn test_static_effect_fills_strip() {
        let (engine, rec) = engine(3);
        engine.start_effect(Effect::Static(Rgb { r: 10, g: 20, b: 30 })).unwrap();
        wait_for(|| rec.frame_count() >= 1);
        engine.stop_effect();

        assert_eq!(rec.last_frame().unwrap(), vec![[10, 20, 30, 0]; 3]);
    }

    #[test]
    fn test_new_effect_replaces_old() {
        let (engine, rec) = engine(3);
        engine.start_effect(Effect::Rainbow).unwrap();
        wait_for(|| rec.frame_count() >= 1);
        engine.start_effect(Effect::Static(Rgb { r: 1, g: 2, b: 3 })).unwrap();
        wait_for(|| rec.last_frame() == Some(vec![[1, 2, 3, 0]; 3]));
        engine.fini();

        assert!(!engine.effect_running());
        assert_eq!(rec.last_frame().unwrap(), vec![[0; 4]; 3]);
        assert_eq!(rec.finis.load(Ordering::SeqCst), 1);
    }
}
