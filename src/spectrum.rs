// Spectrum Module - Turns PCM buffers into smoothed per-LED gradient colors
use rustfft::{num_complex::Complex, FftPlanner};
use std::collections::VecDeque;

use crate::gradients::Gradient;
use crate::types::{PixelUpdate, Segment, UpdateEvent};

/// Hamming window coefficient for sample `n` of `len`
pub fn hamming(n: usize, len: usize) -> f32 {
    if len < 2 {
        return 1.0;
    }
    0.54 - 0.46 * (2.0 * std::f32::consts::PI * n as f32 / (len - 1) as f32).cos()
}

/// Sample `spectrum` at `points` positions spaced evenly on a square-root frequency axis.
///
/// Bin `j` sits at `sqrt(j / (len-1))`, so low bins are spread over more output points.
pub fn warp_resample(spectrum: &[f32], points: usize) -> Vec<f32> {
    if spectrum.is_empty() || points == 0 {
        return vec![0.0; points];
    }
    if spectrum.len() == 1 || points == 1 {
        return vec![spectrum[0]; points];
    }

    let last_bin = (spectrum.len() - 1) as f32;
    (0..points)
        .map(|i| {
            let u = i as f32 / (points - 1) as f32;
            let x = u * u * last_bin;
            let j = x.floor() as usize;
            let frac = x - j as f32;
            let next = (j + 1).min(spectrum.len() - 1);
            spectrum[j] + (spectrum[next] - spectrum[j]) * frac
        })
        .collect()
}

/// Brightness for a normalized magnitude: quiet bins dim but never fully off
pub fn value_for(freq: f32) -> f32 {
    (1.0 - (freq - 1.0).powi(2)).max(0.0).sqrt().clamp(0.25, 1.0)
}

/// Index into the analysis buffer for LED `j` of a mirrored segment of `len` LEDs
pub fn mirrored_index(j: usize, len: usize) -> usize {
    if 2 * j >= len {
        len - 1 - j
    } else {
        j
    }
}

pub struct SpectrumAnalyzer {
    gradient: Gradient,
    segments: Vec<Segment>,
    max_leds: usize,
    window_size: usize,
    black_point: f32,
    mirror: bool,
    planner: FftPlanner<f32>,
    history: VecDeque<Vec<[u8; 4]>>,
}

impl SpectrumAnalyzer {
    pub fn new(
        gradient: Gradient,
        segments: Vec<Segment>,
        window_size: usize,
        black_point: f32,
        mirror: bool,
    ) -> Self {
        let max_leds = segments.iter().map(|s| s.leds).max().unwrap_or(0);
        SpectrumAnalyzer {
            gradient,
            segments,
            max_leds,
            window_size: window_size.max(1),
            black_point: black_point.clamp(0.0, 0.99),
            mirror,
            planner: FftPlanner::new(),
            history: VecDeque::with_capacity(window_size.max(1)),
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Normalized magnitude spectrum of one buffer, first half only
    pub fn spectrum(&mut self, samples: &[f32]) -> Vec<f32> {
        let len = samples.len();
        if len < 2 {
            return Vec::new();
        }

        let mut buffer: Vec<Complex<f32>> = samples
            .iter()
            .enumerate()
            .map(|(n, &s)| Complex { re: s * hamming(n, len), im: 0.0 })
            .collect();

        let fft = self.planner.plan_fft_forward(len);
        fft.process(&mut buffer);

        let mut mags: Vec<f32> = buffer[..len / 2].iter().map(|c| c.norm()).collect();
        let max = mags.iter().cloned().fold(0.0f32, f32::max);
        if max > 0.0 {
            for m in mags.iter_mut() {
                *m /= max;
            }
        }
        mags
    }

    fn colorize(&self, levels: &[f32]) -> Vec<[u8; 4]> {
        levels
            .iter()
            .map(|&f| {
                let f = ((f - self.black_point) / (1.0 - self.black_point)).clamp(0.0, 1.0);
                self.gradient.at_with_value(f as f64, value_for(f) as f64)
            })
            .collect()
    }

    /// Push a frame into the history and return the recency-weighted average
    fn smooth(&mut self, colors: Vec<[u8; 4]>) -> Vec<[u8; 4]> {
        self.history.push_back(colors);
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }

        let mut sums = vec![[0f64; 4]; self.max_leds];
        let mut total = 0f64;
        for (i, frame) in self.history.iter().enumerate() {
            let w = ((i + 1) * (i + 1) + self.window_size) as f64;
            total += w;
            for (acc, px) in sums.iter_mut().zip(frame) {
                for c in 0..4 {
                    acc[c] += px[c] as f64 * w;
                }
            }
        }

        sums.into_iter()
            .map(|acc| {
                let mut out = [0u8; 4];
                for c in 0..4 {
                    out[c] = (acc[c] / total) as u8;
                }
                out
            })
            .collect()
    }

    fn split(&self, colors: &[[u8; 4]]) -> UpdateEvent {
        let segments = self
            .segments
            .iter()
            .map(|seg| {
                let mut pix = Vec::with_capacity(seg.leds * 4);
                for j in 0..seg.leds {
                    let src = if self.mirror { mirrored_index(j, seg.leds) } else { j };
                    pix.extend_from_slice(&colors[src]);
                }
                PixelUpdate { segment_id: seg.id, pix }
            })
            .collect();
        UpdateEvent { segments }
    }

    /// Full pass over one interleaved PCM buffer
    pub fn analyze(&mut self, samples: &[f32]) -> UpdateEvent {
        let spectrum = self.spectrum(samples);
        let levels = warp_resample(&spectrum, self.max_leds);
        let colors = self.colorize(&levels);
        let smoothed = self.smooth(colors);
        self.split(&smoothed)
    }
}
