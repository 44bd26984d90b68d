// Perimeter Module - Reduces a captured frame to one color per LED
//
// The frame border is walked clockwise from the top-left corner into a ring of
// 2W+2H pixels, a window of that ring is cut out for each segment, and the window
// is averaged down to the segment's LED count.
use anyhow::{anyhow, Result};
use std::thread;

/// Number of pixels on the border ring of a `width`x`height` frame
pub fn perimeter_len(width: usize, height: usize) -> usize {
    2 * width + 2 * height
}

/// Ring index of the anchor `(x, y)`, or `None` when the anchor is not on the border.
pub fn offset_of(width: usize, height: usize, x: usize, y: usize) -> Option<usize> {
    if width == 0 || height == 0 || x > width || y >= height {
        return None;
    }

    let (w, h) = (width, height);
    let offset = if x == 0 {
        2 * w + h + (h - y)
    } else if x == w - 1 {
        w + y
    } else if y == 0 {
        x
    } else if y == h - 1 {
        w + h + (w - x)
    } else {
        return None;
    };

    Some(offset % perimeter_len(w, h))
}

/// Number of ring pixels covered walking clockwise from `from` to `to`.
///
/// Never more than one lap: equal offsets cover the whole ring.
pub fn window_size(
    width: usize,
    height: usize,
    from: (usize, usize),
    to: (usize, usize),
) -> Result<usize> {
    let start = offset_of(width, height, from.0, from.1)
        .ok_or_else(|| anyhow!("Anchor {:?} is not on the {}x{} border", from, width, height))?;
    let end = offset_of(width, height, to.0, to.1)
        .ok_or_else(|| anyhow!("Anchor {:?} is not on the {}x{} border", to, width, height))?;

    let len = perimeter_len(width, height);
    match (len - start + end) % len {
        0 => Ok(len),
        size => Ok(size),
    }
}

/// Window of the border ring used by one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub offset: usize,
    pub size: usize,
}

impl Bounds {
    pub fn from_anchors(
        width: usize,
        height: usize,
        from: (usize, usize),
        to: (usize, usize),
    ) -> Result<Self> {
        let offset = offset_of(width, height, from.0, from.1)
            .ok_or_else(|| anyhow!("Anchor {:?} is not on the {}x{} border", from, width, height))?;
        let size = window_size(width, height, from, to)?;
        Ok(Bounds { offset, size })
    }
}

/// Walk the border of an RGBA frame clockwise from the top-left corner.
///
/// The four edges are copied on separate threads into disjoint parts of `ring`:
/// top left to right, right top to bottom, bottom right to left, left bottom to top.
pub fn extract_perimeter(frame: &[u8], width: usize, height: usize, ring: &mut Vec<u8>) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(anyhow!("Frame is empty ({}x{})", width, height));
    }
    if frame.len() != width * height * 4 {
        return Err(anyhow!(
            "Frame is {} bytes, expected {} for {}x{}",
            frame.len(),
            width * height * 4,
            width,
            height
        ));
    }

    ring.clear();
    ring.resize(perimeter_len(width, height) * 4, 0);

    let stride = width * 4;
    let (top, rest) = ring.split_at_mut(width * 4);
    let (right, rest) = rest.split_at_mut(height * 4);
    let (bottom, left) = rest.split_at_mut(width * 4);

    thread::scope(|s| {
        s.spawn(|| {
            top.copy_from_slice(&frame[..stride]);
        });
        s.spawn(|| {
            for (y, px) in right.chunks_exact_mut(4).enumerate() {
                let i = y * stride + (width - 1) * 4;
                px.copy_from_slice(&frame[i..i + 4]);
            }
        });
        s.spawn(|| {
            let row = (height - 1) * stride;
            for (k, px) in bottom.chunks_exact_mut(4).enumerate() {
                let i = row + (width - 1 - k) * 4;
                px.copy_from_slice(&frame[i..i + 4]);
            }
        });
        s.spawn(|| {
            for (k, px) in left.chunks_exact_mut(4).enumerate() {
                let i = (height - 1 - k) * stride;
                px.copy_from_slice(&frame[i..i + 4]);
            }
        });
    });

    Ok(())
}

/// Copy `size` pixels starting at ring pixel `offset`, wrapping around the ring
pub fn window(ring: &[u8], offset: usize, size: usize) -> Vec<u8> {
    let len = ring.len() / 4;
    if len == 0 {
        return vec![0; size * 4];
    }

    let mut out = Vec::with_capacity(size * 4);
    for i in 0..size {
        let p = (offset + i) % len * 4;
        out.extend_from_slice(&ring[p..p + 4]);
    }
    out
}

/// Average `pix` down to `leds` colors.
///
/// Every group holds `len / leds` pixels except the last, which takes the remainder.
pub fn average_pixels(pix: &[u8], leds: usize) -> Vec<u8> {
    let mut out = vec![0u8; leds * 4];
    if leds == 0 {
        return out;
    }

    let len = pix.len() / 4;
    let per_led = len / leds;

    for (i, dst) in out.chunks_exact_mut(4).enumerate() {
        let start = i * per_led;
        let end = if i == leds - 1 { len } else { start + per_led };
        let count = end.saturating_sub(start);
        if count == 0 {
            continue;
        }

        let mut sum = [0u64; 4];
        for px in pix[start * 4..end * 4].chunks_exact(4) {
            for (acc, &c) in sum.iter_mut().zip(px) {
                *acc += c as u64;
            }
        }
        for (d, s) in dst.iter_mut().zip(sum) {
            *d = (s / count as u64) as u8;
        }
    }

    out
}

/// Linear remap of every channel onto `[black, white]`
pub fn adjust_white_point(pix: &mut [u8], black: f64, white: f64) {
    for c in pix.iter_mut() {
        let v = *c as f64 / 256.0 * (white - black) + black;
        *c = v.clamp(0.0, 255.0) as u8;
    }
}

/// Window, average and white-point one segment out of an extracted ring
pub fn segment_colors(ring: &[u8], bounds: Bounds, leds: usize, black: f64, white: f64) -> Vec<u8> {
    let pix = window(ring, bounds.offset, bounds.size);
    let mut out = average_pixels(&pix, leds);
    adjust_white_point(&mut out, black, white);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every pixel encodes its own coordinates: r = x, g = y
    fn coordinate_frame(width: usize, height: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                frame.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        frame
    }

    #[test]
    fn test_offset_in_range() {
        for (w, h) in [(1920, 1080), (16, 9), (3, 2), (2, 2)] {
            let len = perimeter_len(w, h);
            for x in 0..=w {
                for y in [0, h - 1] {
                    let off = offset_of(w, h, x, y).unwrap();
                    assert!(off < len, "{}x{} ({},{}) -> {}", w, h, x, y, off);
                }
            }
            for y in 0..h {
                assert!(offset_of(w, h, 0, y).unwrap() < len);
                assert!(offset_of(w, h, w - 1, y).unwrap() < len);
            }
        }
    }

    #[test]
    fn test_offset_known_anchors() {
        assert_eq!(offset_of(1920, 1080, 0, 0), Some(0));
        assert_eq!(offset_of(1920, 1080, 960, 0), Some(960));
        assert_eq!(offset_of(1920, 1080, 1919, 540), Some(1920 + 540));
        assert_eq!(offset_of(1920, 1080, 1920, 1079), Some(3000));
        assert_eq!(offset_of(1920, 1080, 0, 1079), Some(4921));
    }

    #[test]
    fn test_offset_rejects_interior() {
        assert_eq!(offset_of(1920, 1080, 100, 100), None);
        assert_eq!(offset_of(1920, 1080, 1921, 0), None);
        assert_eq!(offset_of(1920, 1080, 0, 1080), None);
        assert!(window_size(1920, 1080, (5, 5), (0, 0)).is_err());
    }

    #[test]
    fn test_window_size_walks_clockwise() {
        // Along the bottom edge, right to left
        let size = window_size(1920, 1080, (1920, 1079), (0, 1079)).unwrap();
        assert_eq!(size, 4921 - 3000);

        // Top edge stays on the top edge
        assert_eq!(window_size(1920, 1080, (0, 0), (1919, 0)).unwrap(), 1920);
        assert_eq!(window_size(1920, 1080, (0, 0), (1920, 0)).unwrap(), 1920);

        // Wrapping window: from the left edge back round to the top edge
        let size = window_size(1920, 1080, (0, 540), (960, 0)).unwrap();
        let from = offset_of(1920, 1080, 0, 540).unwrap();
        assert_eq!(size, 6000 - from + 960);

        assert_eq!(window_size(1920, 1080, (960, 0), (960, 0)).unwrap(), 6000);
    }

    #[test]
    fn test_window_size_matches_walk_for_every_anchor_pair() {
        let (w, h) = (5, 4);
        let len = perimeter_len(w, h);
        let mut anchors = Vec::new();
        for x in 0..=w {
            anchors.push((x, 0));
            anchors.push((x, h - 1));
        }
        for y in 0..h {
            anchors.push((0, y));
            anchors.push((w - 1, y));
        }

        for &from in &anchors {
            for &to in &anchors {
                let start = offset_of(w, h, from.0, from.1).unwrap();
                let end = offset_of(w, h, to.0, to.1).unwrap();
                let mut steps = 1;
                while (start + steps) % len != end {
                    steps += 1;
                }
                let size = window_size(w, h, from, to).unwrap();
                assert_eq!(size, steps, "{:?} -> {:?}", from, to);
                assert!((1..=len).contains(&size));
            }
        }
    }

    #[test]
    fn test_extract_perimeter_order() {
        let (w, h) = (4, 3);
        let frame = coordinate_frame(w, h);
        let mut ring = Vec::new();
        extract_perimeter(&frame, w, h, &mut ring).unwrap();

        let coords: Vec<(u8, u8)> = ring.chunks_exact(4).map(|p| (p[0], p[1])).collect();
        assert_eq!(coords.len(), perimeter_len(w, h));
        assert_eq!(
            coords,
            vec![
                // top
                (0, 0), (1, 0), (2, 0), (3, 0),
                // right
                (3, 0), (3, 1), (3, 2),
                // bottom
                (3, 2), (2, 2), (1, 2), (0, 2),
                // left
                (0, 2), (0, 1), (0, 0),
            ]
        );
    }

    #[test]
    fn test_extract_rejects_short_frame() {
        let mut ring = Vec::new();
        assert!(extract_perimeter(&[0; 12], 2, 2, &mut ring).is_err());
    }

    #[test]
    fn test_extract_rejects_empty_frame() {
        let mut ring = Vec::new();
        assert!(extract_perimeter(&[], 0, 0, &mut ring).is_err());
        assert!(extract_perimeter(&[], 4, 0, &mut ring).is_err());
    }

    #[test]
    fn test_window_wraps_and_repeats() {
        let ring: Vec<u8> = (0..4u8).flat_map(|i| [i, i, i, i]).collect();
        let out = window(&ring, 3, 6);
        let firsts: Vec<u8> = out.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(firsts, vec![3, 0, 1, 2, 3, 0]);

        // Same offset and size always cut the same window
        assert_eq!(window(&ring, 3, 6), out);
    }

    #[test]
    fn test_average_last_group_absorbs_remainder() {
        // 10 pixels into 3 groups: 3, 3, 4
        let pix: Vec<u8> = (0..10u8).flat_map(|i| [i * 10, 0, 0, 255]).collect();
        let out = average_pixels(&pix, 3);
        assert_eq!(out.len(), 12);
        assert_eq!(out[0], (0 + 10 + 20) / 3);
        assert_eq!(out[4], (30 + 40 + 50) / 3);
        assert_eq!(out[8], ((60 + 70 + 80 + 90) / 4) as u8);
        assert_eq!(out[3], 255);

        let len = 10;
        let leds = 3;
        let last = len - (len / leds) * (leds - 1);
        assert_eq!(last, 4);
    }

    #[test]
    fn test_average_truncates() {
        let pix = [1, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(average_pixels(&pix, 1), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_average_more_leds_than_pixels() {
        let pix = [200, 200, 200, 200];
        let out = average_pixels(&pix, 3);
        assert_eq!(&out[..8], &[0; 8]);
        assert_eq!(&out[8..], &[200, 200, 200, 200]);
    }

    #[test]
    fn test_white_point() {
        let mut pix = [0, 128, 255, 64];
        adjust_white_point(&mut pix, 16.0, 256.0);
        assert_eq!(pix[0], 16);
        assert_eq!(pix[1], 136);
        assert_eq!(pix[2], 255);

        let mut identity = [0, 100, 255];
        adjust_white_point(&mut identity, 0.0, 256.0);
        assert_eq!(identity, [0, 100, 255]);
    }

    #[test]
    fn test_segment_colors_full_top_edge() {
        let (w, h) = (8, 4);
        let frame = coordinate_frame(w, h);
        let mut ring = Vec::new();
        extract_perimeter(&frame, w, h, &mut ring).unwrap();

        let bounds = Bounds { offset: 0, size: w };
        let out = segment_colors(&ring, bounds, 2, 0.0, 256.0);
        // x 0..4 averages to 1, x 4..8 averages to 5
        assert_eq!(out[0], 1);
        assert_eq!(out[4], 5);
        assert_eq!(out[1], 0);
    }

    #[test]
    fn test_bottom_edge_window_colors() {
        let (w, h) = (8, 4);
        let frame = coordinate_frame(w, h);
        let mut ring = Vec::new();
        extract_perimeter(&frame, w, h, &mut ring).unwrap();

        let bounds = Bounds::from_anchors(w, h, (w, h - 1), (0, h - 1)).unwrap();
        assert_eq!(bounds.offset, w + h);
        assert_eq!(bounds.size, w + 1);

        // Every sampled pixel sits on the bottom row
        let pix = window(&ring, bounds.offset, bounds.size);
        assert!(pix.chunks_exact(4).all(|p| p[1] == (h - 1) as u8));

        // Right half then left half: x 7..4 averages to 5, x 3..0 plus the corner to 1
        let out = segment_colors(&ring, bounds, 2, 0.0, 256.0);
        assert_eq!(&out[..4], &[5, 3, 0, 255]);
        assert_eq!(&out[4..], &[(3 + 2 + 1 + 0 + 0) / 5, 3, 0, 255]);
    }

    #[test]
    fn test_top_edge_window_colors() {
        let (w, h) = (8, 4);
        let frame = coordinate_frame(w, h);
        let mut ring = Vec::new();
        extract_perimeter(&frame, w, h, &mut ring).unwrap();

        let bounds = Bounds::from_anchors(w, h, (0, 0), (w, 0)).unwrap();
        assert_eq!(bounds, Bounds { offset: 0, size: w });

        let out = segment_colors(&ring, bounds, 4, 0.0, 256.0);
        let reds: Vec<u8> = out.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(reds, vec![0, 2, 4, 6]);
        assert!(out.chunks_exact(4).all(|p| p[1] == 0));
    }
}
