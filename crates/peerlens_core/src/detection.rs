/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::inference::Tensor;

/// One detection in model input coordinates (top-left + size).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
    pub class_id: usize,
}

impl DetectionBox {
    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

/// Intersection over union of two axis-aligned boxes. Zero when they do not overlap.
pub fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Class-agnostic non-max suppression.
///
/// Boxes are ordered by score descending (stable, so equal scores keep scan
/// order) and each kept box removes every later box overlapping it by more
/// than `iou_threshold`, whatever its class.
pub fn non_max_suppression(mut boxes: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    kept
}

/// Model output layout: `num_proposals` rows of
/// `[cx, cy, w, h, objectness, class_0 .. class_{n-1}]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
    pub num_proposals: usize,
    pub num_classes: usize,
}

impl OutputLayout {
    pub fn stride(&self) -> usize {
        5 + self.num_classes
    }

    pub fn expected_len(&self) -> usize {
        self.num_proposals.saturating_mul(self.stride())
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    layout: OutputLayout,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl Decoder {
    pub fn new(layout: OutputLayout, confidence_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            layout,
            confidence_threshold,
            iou_threshold,
        }
    }

    pub fn from_config(cfg: &DetectorConfig) -> Self {
        Self::new(
            OutputLayout {
                num_proposals: cfg.num_proposals,
                num_classes: cfg.num_classes,
            },
            cfg.confidence_threshold,
            cfg.iou_threshold,
        )
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Two-threshold proposal filter, before suppression.
    ///
    /// A buffer whose length is not exactly `num_proposals * (5 + num_classes)`
    /// yields no proposals at all.
    pub fn decode(&self, output: &[f32]) -> Vec<DetectionBox> {
        let expected = self.layout.expected_len();
        if output.len() != expected {
            warn!(len = output.len(), expected, "unexpected model output length");
            return Vec::new();
        }

        let stride = self.layout.stride();
        let mut boxes = Vec::new();
        for row in output.chunks_exact(stride) {
            let objectness = row[4];
            if !(objectness >= self.confidence_threshold) {
                continue;
            }

            let mut max_prob = 0.0f32;
            let mut class_id = 0usize;
            for (j, &p) in row[5..].iter().enumerate() {
                if p > max_prob {
                    max_prob = p;
                    class_id = j;
                }
            }

            let score = max_prob * objectness;
            if !(score > self.confidence_threshold) {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            if !(w >= 0.0 && h >= 0.0) || !cx.is_finite() || !cy.is_finite() || !w.is_finite() || !h.is_finite() {
                continue;
            }
            boxes.push(DetectionBox {
                x: cx - w / 2.0,
                y: cy - h / 2.0,
                w,
                h,
                score: score.min(1.0),
                class_id,
            });
        }
        if !boxes.is_empty() {
            debug!(candidates = boxes.len(), "proposals above threshold");
        }
        boxes
    }

    /// Decode followed by suppression.
    pub fn detect(&self, output: &[f32]) -> Vec<DetectionBox> {
        non_max_suppression(self.decode(output), self.iou_threshold)
    }

    /// Like [`Decoder::detect`], also rejecting tensors whose shape does not
    /// end in `[num_proposals, 5 + num_classes]`.
    pub fn detect_tensor(&self, output: &Tensor) -> Vec<DetectionBox> {
        let shape = output.shape();
        let dims = match shape {
            [n, s] => Some((*n, *s)),
            [1, n, s] => Some((*n, *s)),
            _ => None,
        };
        if dims != Some((self.layout.num_proposals, self.layout.stride())) {
            warn!(?shape, "unexpected model output shape");
            return Vec::new();
        }
        self.detect(output.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32, y: f32, w: f32, h: f32, score: f32, class_id: usize) -> DetectionBox {
        DetectionBox { x, y, w, h, score, class_id }
    }

    fn decoder(num_proposals: usize) -> Decoder {
        Decoder::new(
            OutputLayout {
                num_proposals,
                num_classes: 80,
            },
            0.45,
            0.45,
        )
    }

    fn proposal(out: &mut [f32], i: usize, cx: f32, cy: f32, w: f32, h: f32, obj: f32, class: usize, p: f32) {
        let o = i * 85;
        out[o] = cx;
        out[o + 1] = cy;
        out[o + 2] = w;
        out[o + 3] = h;
        out[o + 4] = obj;
        out[o + 5 + class] = p;
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = bx(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = bx(20.0, 0.0, 10.0, 10.0, 0.9, 0);
        let c = bx(0.0, 10.0, 10.0, 10.0, 0.9, 0);
        assert_eq!(iou(&a, &b), 0.0);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn iou_with_itself_is_one() {
        let a = bx(3.0, 4.0, 12.5, 7.0, 0.5, 2);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_degenerate_boxes_is_zero() {
        let a = bx(3.0, 4.0, 0.0, 0.0, 0.5, 2);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = bx(0.0, 0.0, 10.0, 10.0, 0.9, 0);
        let b = bx(5.0, 0.0, 10.0, 10.0, 0.9, 0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn decodes_single_proposal() {
        let d = decoder(3);
        let mut out = vec![0.0; 3 * 85];
        proposal(&mut out, 1, 100.0, 100.0, 50.0, 50.0, 0.9, 3, 0.9);
        let boxes = d.detect(&out);
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert!((b.x - 75.0).abs() < 1e-4);
        assert!((b.y - 75.0).abs() < 1e-4);
        assert!((b.w - 50.0).abs() < 1e-4);
        assert!((b.h - 50.0).abs() < 1e-4);
        assert!((b.score - 0.81).abs() < 1e-4);
        assert_eq!(b.class_id, 3);
    }

    #[test]
    fn wrong_length_yields_nothing() {
        let d = decoder(3);
        assert!(d.detect(&vec![0.9; 3 * 85 - 1]).is_empty());
        assert!(d.detect(&[]).is_empty());
        assert!(d.detect(&vec![0.9; 4 * 85]).is_empty());
    }

    #[test]
    fn objectness_gate_applies_before_class_scan() {
        let d = decoder(1);
        let mut out = vec![0.0; 85];
        proposal(&mut out, 0, 10.0, 10.0, 5.0, 5.0, 0.44, 0, 1.0);
        assert!(d.decode(&out).is_empty());
    }

    #[test]
    fn final_score_must_strictly_exceed_threshold() {
        let d = decoder(1);
        let mut out = vec![0.0; 85];
        // 0.9 * 0.5 = 0.45, not above 0.45
        proposal(&mut out, 0, 10.0, 10.0, 5.0, 5.0, 0.9, 7, 0.5);
        assert!(d.decode(&out).is_empty());
    }

    #[test]
    fn argmax_first_seen_wins_ties() {
        let d = decoder(1);
        let mut out = vec![0.0; 85];
        proposal(&mut out, 0, 10.0, 10.0, 5.0, 5.0, 0.9, 4, 0.8);
        out[5 + 9] = 0.8;
        let boxes = d.decode(&out);
        assert_eq!(boxes[0].class_id, 4);
    }

    #[test]
    fn tensor_shape_is_checked() {
        let d = decoder(2);
        let mut out = vec![0.0; 2 * 85];
        proposal(&mut out, 0, 100.0, 100.0, 50.0, 50.0, 0.9, 3, 0.9);
        let ok = Tensor::new(vec![1, 2, 85], out.clone()).unwrap();
        assert_eq!(d.detect_tensor(&ok).len(), 1);
        let transposed = Tensor::new(vec![1, 85, 2], out).unwrap();
        assert!(d.detect_tensor(&transposed).is_empty());
    }

    #[test]
    fn nms_keeps_best_and_drops_overlaps() {
        let boxes = vec![
            bx(0.0, 0.0, 10.0, 10.0, 0.6, 0),
            bx(1.0, 1.0, 10.0, 10.0, 0.9, 0),
            bx(50.0, 50.0, 10.0, 10.0, 0.7, 1),
        ];
        let kept = non_max_suppression(boxes, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn nms_is_class_agnostic() {
        let boxes = vec![bx(0.0, 0.0, 10.0, 10.0, 0.9, 0), bx(0.0, 0.0, 10.0, 10.0, 0.8, 5)];
        let kept = non_max_suppression(boxes, 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_id, 0);
    }

    #[test]
    fn nms_equal_scores_keep_scan_order() {
        let boxes = vec![bx(0.0, 0.0, 10.0, 10.0, 0.8, 1), bx(0.5, 0.5, 10.0, 10.0, 0.8, 2)];
        let kept = non_max_suppression(boxes, 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_id, 1);
    }

    #[test]
    fn nms_output_is_sorted_subset_without_overlaps() {
        // deterministic pseudo-random scatter
        let mut seed = 0x2545_f491_u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 1000) as f32 / 1000.0
        };
        let input: Vec<DetectionBox> = (0..200)
            .map(|i| bx(next() * 100.0, next() * 100.0, 5.0 + next() * 30.0, 5.0 + next() * 30.0, next(), i % 7))
            .collect();
        let threshold = 0.4;
        let kept = non_max_suppression(input.clone(), threshold);

        assert!(!kept.is_empty());
        for k in &kept {
            assert!(input.contains(k));
        }
        for pair in kept.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(iou(a, b) <= threshold);
            }
        }
    }
}
