// Test pattern - synthetic displays behind both capture primitives
use image::ImageBuffer;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Blitter, Display, DuplicationApi, DuplicationSession, Frame, Orientation};
use crate::effects::wheel;
use crate::error::CaptureError;

/// Scrolling color bands on a fixed set of virtual displays
pub struct TestPattern {
    displays: Vec<Display>,
    tick: AtomicUsize,
}

impl TestPattern {
    pub fn new(displays: Vec<Display>) -> Self {
        TestPattern { displays, tick: AtomicUsize::new(0) }
    }
}

impl Default for TestPattern {
    fn default() -> Self {
        TestPattern::new(vec![Display {
            id: 0,
            width: 1920,
            height: 1080,
            origin_x: 0,
            origin_y: 0,
            orientation: Orientation::Landscape,
        }])
    }
}

/// Each row gets one wheel color, shifted a little every tick
fn render(display: &Display, tick: usize) -> Result<Frame, CaptureError> {
    let (width, height) = display.frame_size();
    let mut data = vec![0u8; width * height * 4];
    for (y, row) in data.chunks_exact_mut(width * 4).enumerate() {
        let mut color = wheel(y * 768 / height.max(1) + tick * 4);
        color[3] = 255;
        for px in row.chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
    }
    ImageBuffer::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| CaptureError::Unavailable("frame buffer size mismatch".into()))
}

struct PatternSession {
    display: Display,
    tick: usize,
}

impl DuplicationSession for PatternSession {
    fn frame_size(&self) -> (usize, usize) {
        self.display.frame_size()
    }

    fn acquire(&mut self) -> Result<Frame, CaptureError> {
        self.tick += 1;
        render(&self.display, self.tick)
    }
}

impl DuplicationApi for TestPattern {
    fn outputs(&self) -> Result<Vec<Display>, CaptureError> {
        Ok(self.displays.clone())
    }

    fn open(&self, display: &Display) -> Result<Box<dyn DuplicationSession>, CaptureError> {
        let display = self
            .displays
            .iter()
            .find(|d| d.id == display.id)
            .copied()
            .ok_or_else(|| CaptureError::Unavailable(format!("no display {}", display.id)))?;
        Ok(Box::new(PatternSession { display, tick: 0 }))
    }
}

impl Blitter for TestPattern {
    fn screens(&self) -> Result<Vec<Display>, CaptureError> {
        Ok(self.displays.clone())
    }

    fn grab(&self, display: &Display) -> Result<Frame, CaptureError> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        render(display, tick)
    }
}
