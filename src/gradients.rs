// Gradients Module - Color keypoint gradients used by the audio visualizer
use anyhow::{anyhow, Result};
use colorgrad::{BlendMode, Color, CustomGradient};
use serde::{Deserialize, Serialize};

use crate::types::Rgb;

/// Color space the gradient blends in between keypoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blend {
    Rgb,
    Hsv,
    #[default]
    Oklab,
}

impl From<Blend> for BlendMode {
    fn from(blend: Blend) -> Self {
        match blend {
            Blend::Rgb => BlendMode::Rgb,
            Blend::Hsv => BlendMode::Hsv,
            Blend::Oklab => BlendMode::Oklab,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub color: Rgb,
    pub position: f64,
}

/// Ordered keypoints over [0, 1]; immutable once built
pub struct Gradient {
    keypoints: Vec<Keypoint>,
    inner: colorgrad::Gradient,
}

impl Gradient {
    pub fn new(keypoints: Vec<Keypoint>, blend: Blend) -> Result<Self> {
        if keypoints.len() < 2 {
            return Err(anyhow!("Gradient needs at least 2 colors, got {}", keypoints.len()));
        }
        for pair in keypoints.windows(2) {
            if pair[1].position < pair[0].position {
                return Err(anyhow!(
                    "Gradient positions must be increasing ({} after {})",
                    pair[1].position,
                    pair[0].position
                ));
            }
        }
        if keypoints.iter().any(|k| !(0.0..=1.0).contains(&k.position)) {
            return Err(anyhow!("Gradient positions must lie in [0, 1]"));
        }

        let colors: Vec<Color> = keypoints
            .iter()
            .map(|k| Color::from_rgba8(k.color.r, k.color.g, k.color.b, 255))
            .collect();
        let positions: Vec<f64> = keypoints.iter().map(|k| k.position).collect();

        let inner = CustomGradient::new()
            .colors(&colors)
            .domain(&positions)
            .mode(blend.into())
            .build()?;

        Ok(Gradient { keypoints, inner })
    }

    /// Evenly spaced keypoints from hex strings ("FF0000", "#00FF00", ...)
    pub fn from_hex_colors(colors: &[String], blend: Blend) -> Result<Self> {
        let last = colors.len().saturating_sub(1).max(1) as f64;
        let keypoints = colors
            .iter()
            .enumerate()
            .map(|(i, hex)| {
                Ok(Keypoint {
                    color: Rgb::from_hex(hex)?,
                    position: i as f64 / last,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(keypoints, blend)
    }

    /// Color at `t` with its HSV value replaced by `value`; `t` is clamped to the keypoint range
    pub fn at_with_value(&self, t: f64, value: f64) -> [u8; 4] {
        let lo = self.keypoints[0].position;
        let hi = self.keypoints[self.keypoints.len() - 1].position;
        let (h, s, _, _) = self.inner.at(t.clamp(lo, hi)).to_hsva();
        let mut rgba = Color::from_hsva(h, s, value.clamp(0.0, 1.0), 1.0).to_rgba8();
        rgba[3] = 255;
        rgba
    }
}
