/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Display-space geometry for drawing detections over the video.

use serde::Serialize;

use crate::detection::DetectionBox;
use crate::labels::label_for;

pub fn class_hue(class_id: usize) -> u32 {
    ((class_id * 47) % 360) as u32
}

pub fn class_color(class_id: usize) -> String {
    format!("hsl({}, 80%, 55%)", class_hue(class_id))
}

pub fn label_text(b: &DetectionBox) -> String {
    format!("{}: {:.2}", label_for(b.class_id), b.score)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub color: String,
    pub label: String,
    /// Baseline for the label: above the box, or inside it near the top edge.
    pub label_y: f32,
}

/// Maps model-space boxes onto a `display_w`x`display_h` surface.
pub fn layout(
    boxes: &[DetectionBox],
    model_w: u32,
    model_h: u32,
    display_w: f32,
    display_h: f32,
) -> Vec<OverlayBox> {
    let sx = display_w / model_w.max(1) as f32;
    let sy = display_h / model_h.max(1) as f32;
    boxes
        .iter()
        .map(|b| {
            let y = b.y * sy;
            OverlayBox {
                x: b.x * sx,
                y,
                w: b.w * sx,
                h: b.h * sy,
                color: class_color(b.class_id),
                label: label_text(b),
                label_y: if y > 20.0 { y - 5.0 } else { y + 16.0 },
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassCount {
    pub class_id: usize,
    pub label: &'static str,
    pub count: usize,
}

/// Detections per class, in order of first appearance.
pub fn class_counts(boxes: &[DetectionBox]) -> Vec<ClassCount> {
    let mut out: Vec<ClassCount> = Vec::new();
    for b in boxes {
        match out.iter_mut().find(|c| c.class_id == b.class_id) {
            Some(c) => c.count += 1,
            None => out.push(ClassCount {
                class_id: b.class_id,
                label: label_for(b.class_id),
                count: 1,
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32, y: f32, class_id: usize, score: f32) -> DetectionBox {
        DetectionBox {
            x,
            y,
            w: 64.0,
            h: 32.0,
            score,
            class_id,
        }
    }

    #[test]
    fn scales_into_display_space() {
        let out = layout(&[bx(320.0, 160.0, 0, 0.876)], 640, 640, 1280.0, 320.0);
        let o = &out[0];
        assert_eq!((o.x, o.y, o.w, o.h), (640.0, 80.0, 128.0, 16.0));
        assert_eq!(o.label, "person: 0.88");
        assert_eq!(o.color, "hsl(0, 80%, 55%)");
        assert_eq!(o.label_y, 75.0);
    }

    #[test]
    fn label_moves_inside_near_top() {
        let out = layout(&[bx(0.0, 5.0, 2, 0.5)], 640, 640, 640.0, 640.0);
        assert_eq!(out[0].label_y, 21.0);
        assert_eq!(out[0].label, "car: 0.50");
    }

    #[test]
    fn hue_wraps() {
        assert_eq!(class_hue(1), 47);
        assert_eq!(class_hue(8), 16);
    }

    #[test]
    fn counts_keep_first_seen_order() {
        let boxes = [bx(0.0, 0.0, 16, 0.9), bx(0.0, 0.0, 0, 0.9), bx(9.0, 9.0, 16, 0.8)];
        let counts = class_counts(&boxes);
        assert_eq!(counts.len(), 2);
        assert_eq!((counts[0].label, counts[0].count), ("dog", 2));
        assert_eq!((counts[1].label, counts[1].count), ("person", 1));
    }
}
