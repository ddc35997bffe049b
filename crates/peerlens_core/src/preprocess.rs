/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use std::path::Path;
use std::time::Instant;

use crate::inference::Tensor;

/// One captured frame at the source's native resolution, RGBA8 row-major.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// Start of the end-to-end latency measurement for this frame.
    pub captured_at: Instant,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame has zero dimensions"));
        }
        if rgba.len() != expected {
            return Err(anyhow!("frame {width}x{height} needs {expected} bytes, got {}", rgba.len()));
        }
        Ok(Self {
            width,
            height,
            rgba,
            captured_at: Instant::now(),
        })
    }

    pub fn from_image(img: &DynamicImage) -> Result<Self> {
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        Self::new(w, h, rgba.into_raw())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path).with_context(|| format!("open image {}", path.display()))?;
        Self::from_image(&img)
    }
}

/// Scales `frame` to `width`x`height` and lays it out as `[1, 3, H, W]` RGB in `[0, 1]`.
pub fn preprocess(frame: &RawFrame, width: u32, height: u32) -> Result<Tensor> {
    let src = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    let resized = if src.dimensions() == (width, height) {
        src
    } else {
        image::imageops::resize(&src, width, height, FilterType::Triangle)
    };

    let (w, h) = (width as usize, height as usize);
    let plane = w * h;
    let mut data = vec![0.0f32; 3 * plane];
    for (col, row, px) in resized.enumerate_pixels() {
        let offset = row as usize * w + col as usize;
        data[offset] = px[0] as f32 / 255.0;
        data[plane + offset] = px[1] as f32 / 255.0;
        data[2 * plane + offset] = px[2] as f32 / 255.0;
    }
    Tensor::new(vec![1, 3, h, w], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RawFrame {
        let mut rgba = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                rgba.extend_from_slice(&[(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8, 255]);
            }
        }
        RawFrame::new(w, h, rgba).unwrap()
    }

    #[test]
    fn planar_layout_at_native_size() {
        let frame = RawFrame::new(2, 1, vec![255, 0, 51, 255, 0, 102, 0, 255]).unwrap();
        let t = preprocess(&frame, 2, 1).unwrap();
        assert_eq!(t.shape(), &[1, 3, 1, 2]);
        let d = t.data();
        // R plane, G plane, B plane
        assert_eq!(&d[0..2], &[1.0, 0.0]);
        assert!((d[2] - 0.0).abs() < 1e-6 && (d[3] - 0.4).abs() < 1e-6);
        assert!((d[4] - 0.2).abs() < 1e-6 && (d[5] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn is_deterministic() {
        let frame = gradient(37, 23);
        let a = preprocess(&frame, 16, 16).unwrap();
        let b = preprocess(&frame, 16, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shape(), &[1, 3, 16, 16]);
        assert!(a.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn rejects_bad_buffers() {
        assert!(RawFrame::new(2, 2, vec![0; 15]).is_err());
        assert!(RawFrame::new(0, 2, vec![]).is_err());
    }
}
