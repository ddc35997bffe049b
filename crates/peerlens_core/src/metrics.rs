/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

const WINDOW: usize = 100;

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Value at `floor(len * q)` of an ascending slice; 0 when empty.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn median_p95(window: &VecDeque<f64>) -> (f64, f64) {
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    (percentile(&sorted, 0.5), percentile(&sorted, 0.95))
}

fn push_bounded(window: &mut VecDeque<f64>, v: f64) {
    if window.len() == WINDOW {
        window.pop_front();
    }
    window.push_back(v);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchmarkSummary {
    #[serde(serialize_with = "ser_round2")]
    pub median_e2e_latency_ms: f64,
    #[serde(serialize_with = "ser_round2")]
    pub p95_e2e_latency_ms: f64,
    #[serde(serialize_with = "ser_round2")]
    pub processed_fps: f64,
}

fn ser_round2<S: serde::Serializer>(v: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(round2(*v))
}

impl BenchmarkSummary {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self).context("encode benchmark summary")?;
        std::fs::write(path, body).with_context(|| format!("write {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BenchmarkOutcome {
    NotStarted,
    Finished(BenchmarkSummary),
}

/// Live counters, refreshed once per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LiveMetrics {
    pub fps: u64,
    pub median_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub total_frames: u64,
}

#[derive(Default)]
struct Inner {
    active: bool,
    started_at: Option<Instant>,
    bench_frames: u64,
    bench_window: VecDeque<f64>,

    live_window: VecDeque<f64>,
    second_start: Option<Instant>,
    second_frames: u64,
    live: LiveMetrics,
}

/// Rolling latency and throughput accounting for the detection loop.
#[derive(Default)]
pub struct MetricsHarness {
    inner: Mutex<Inner>,
}

impl MetricsHarness {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start_benchmark(&self) {
        self.start_benchmark_at(Instant::now());
    }

    fn start_benchmark_at(&self, now: Instant) {
        let mut g = self.lock();
        g.active = true;
        g.started_at = Some(now);
        g.bench_frames = 0;
        g.bench_window.clear();
        info!("benchmark started");
    }

    pub fn stop_benchmark(&self) -> BenchmarkOutcome {
        self.stop_benchmark_at(Instant::now())
    }

    fn stop_benchmark_at(&self, now: Instant) -> BenchmarkOutcome {
        let mut g = self.lock();
        if !g.active {
            return BenchmarkOutcome::NotStarted;
        }
        g.active = false;
        let elapsed = g
            .started_at
            .take()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
            .as_secs_f64();
        let processed_fps = if elapsed > 0.0 {
            g.bench_frames as f64 / elapsed
        } else {
            0.0
        };
        let (median, p95) = median_p95(&g.bench_window);
        let summary = BenchmarkSummary {
            median_e2e_latency_ms: median,
            p95_e2e_latency_ms: p95,
            processed_fps,
        };
        info!(
            frames = g.bench_frames,
            median_ms = round2(median),
            p95_ms = round2(p95),
            fps = round2(processed_fps),
            "benchmark finished"
        );
        BenchmarkOutcome::Finished(summary)
    }

    pub fn is_benchmarking(&self) -> bool {
        self.lock().active
    }

    /// Records one frame that completed end-to-end processing.
    pub fn record_frame(&self, latency: Duration) {
        self.record_frame_at(latency, Instant::now());
    }

    fn record_frame_at(&self, latency: Duration, now: Instant) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut g = self.lock();
        if g.active {
            g.bench_frames += 1;
            push_bounded(&mut g.bench_window, ms);
        }

        push_bounded(&mut g.live_window, ms);
        g.second_frames += 1;
        let second_start = *g.second_start.get_or_insert(now);
        if now.saturating_duration_since(second_start) > Duration::from_secs(1) {
            let (median, p95) = median_p95(&g.live_window);
            g.live = LiveMetrics {
                fps: g.second_frames,
                median_latency_ms: median,
                p95_latency_ms: p95,
                total_frames: g.live.total_frames + g.second_frames,
            };
            g.second_frames = 0;
            g.second_start = Some(now);
        }
    }

    pub fn live(&self) -> LiveMetrics {
        self.lock().live
    }

    /// `(start, stop)` callbacks for the embedding shell.
    pub fn controls(
        self: &Arc<Self>,
    ) -> (
        impl Fn() + Send + Sync + 'static,
        impl Fn() -> BenchmarkOutcome + Send + Sync + 'static,
    ) {
        let a = self.clone();
        let b = self.clone();
        (move || a.start_benchmark(), move || b.stop_benchmark())
    }
}
