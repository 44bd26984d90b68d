// Effects Module - Ambient effects rendered on the server while no visualizer streams
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::engine::RenderEngine;
use crate::types::Rgb;

const RAINBOW_STEPS: usize = 768;
const FRAME_DELAY: Duration = Duration::from_millis(16);
// DDP receivers drop back to their own program after ~1s without data
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Rainbow,
    Static(Rgb),
}

/// Color wheel position in [0, 768): red -> green -> blue -> red
pub fn wheel(pos: usize) -> [u8; 4] {
    let pos = pos % RAINBOW_STEPS;
    let t = (pos % 256) as u8;
    match pos / 256 {
        0 => [255 - t, t, 0, 0],
        1 => [0, 255 - t, t, 0],
        _ => [t, 0, 255 - t, 0],
    }
}

/// Run `effect` until `cancel` is raised. Checked before each frame and between LED writes.
pub fn run(effect: Effect, engine: &RenderEngine, cancel: &AtomicBool) {
    debug!("Effect {:?} started", effect);
    match effect {
        Effect::Rainbow => rainbow(engine, cancel),
        Effect::Static(color) => fill(engine, cancel, color),
    }
    debug!("Effect {:?} stopped", effect);
}

fn cancelled(cancel: &AtomicBool) -> bool {
    cancel.load(Ordering::Relaxed)
}

fn rainbow(engine: &RenderEngine, cancel: &AtomicBool) {
    let leds = engine.led_count();
    loop {
        for i in 0..RAINBOW_STEPS {
            if cancelled(cancel) {
                return;
            }
            for j in 0..leds {
                if cancelled(cancel) {
                    return;
                }
                if let Err(e) = engine.set_led_color(j, wheel(i + j)) {
                    warn!("Rainbow stopped: {}", e);
                    return;
                }
            }
            if let Err(e) = engine.render_wait() {
                warn!("Rainbow render failed: {}", e);
            }
            thread::sleep(FRAME_DELAY);
        }
    }
}

fn fill(engine: &RenderEngine, cancel: &AtomicBool, color: Rgb) {
    let rgbw = [color.r, color.g, color.b, 0];
    for j in 0..engine.led_count() {
        if cancelled(cancel) {
            return;
        }
        if let Err(e) = engine.set_led_color(j, rgbw) {
            warn!("Static color stopped: {}", e);
            return;
        }
    }

    let mut last_render: Option<Instant> = None;
    while !cancelled(cancel) {
        if last_render.map_or(true, |t| t.elapsed() >= KEEPALIVE_INTERVAL) {
            if let Err(e) = engine.render_wait() {
                warn!("Static render failed: {}", e);
            }
            last_render = Some(Instant::now());
        }
        thread::sleep(FRAME_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wheel_phases() {
        assert_eq!(wheel(0), [255, 0, 0, 0]);
        assert_eq!(wheel(256), [0, 255, 0, 0]);
        assert_eq!(wheel(512), [0, 0, 255, 0]);
        assert_eq!(wheel(767), [255, 0, 0, 0]);
        assert_eq!(wheel(768 + 128), wheel(128));
        assert_eq!(wheel(128), [127, 128, 0, 0]);
    }
}
