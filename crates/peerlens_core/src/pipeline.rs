/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::detection::{DetectionBox, Decoder};
use crate::frame_source::FrameSlot;
use crate::inference::{load_engine, InferenceEngine};
use crate::metrics::MetricsHarness;
use crate::preprocess::{preprocess, RawFrame};

pub type Detections = Arc<Vec<DetectionBox>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorStatus {
    Loading,
    Ready,
    /// Model load failed; detection stays off for this session.
    Failed(String),
}

/// Clears the busy flag when the in-flight job ends, including on abort.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct Job {
    engine: Arc<dyn InferenceEngine>,
    decoder: Arc<Decoder>,
    metrics: Arc<MetricsHarness>,
    input: (u32, u32),
    detections: Arc<watch::Sender<Detections>>,
    completed: Arc<AtomicU64>,
}

impl Job {
    async fn process(self, frame: RawFrame) {
        let captured_at = frame.captured_at;
        let (w, h) = self.input;
        let tensor = match tokio::task::spawn_blocking(move || preprocess(&frame, w, h)).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                warn!("preprocess failed: {e:#}");
                return;
            }
            Err(e) => {
                warn!("preprocess task failed: {e}");
                return;
            }
        };

        match self.engine.run(tensor).await {
            Ok(output) => {
                let boxes = self.decoder.detect_tensor(&output);
                debug!(boxes = boxes.len(), "frame detected");
                self.detections.send_replace(Arc::new(boxes));
                self.metrics.record_frame(captured_at.elapsed());
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            // Previous detections stay published.
            Err(e) => warn!(engine = self.engine.name(), "inference failed: {e:#}"),
        }
    }
}

/// Pulls the newest frame from the slot on every tick and runs at most one
/// inference at a time.
pub struct DetectionLoop {
    job: Job,
    slot: Arc<FrameSlot>,
    tick: Duration,
    busy: Arc<AtomicBool>,
}

impl DetectionLoop {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        decoder: Decoder,
        slot: Arc<FrameSlot>,
        metrics: Arc<MetricsHarness>,
        input: (u32, u32),
        tick: Duration,
    ) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            job: Job {
                engine,
                decoder: Arc::new(decoder),
                metrics,
                input,
                detections: Arc::new(tx),
                completed: Arc::new(AtomicU64::new(0)),
            },
            slot,
            tick: tick.max(Duration::from_millis(1)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Detections> {
        self.job.detections.subscribe()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inflight: Option<JoinHandle<()>> = None;
        let mut busy_ticks = 0u64;
        info!(engine = self.job.engine.name(), tick_ms = self.tick.as_millis() as u64, "detection loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if self.busy.load(Ordering::Acquire) {
                        busy_ticks += 1;
                        continue;
                    }
                    let Some(frame) = self.slot.take() else {
                        continue;
                    };
                    self.busy.store(true, Ordering::Release);
                    let guard = BusyGuard(self.busy.clone());
                    let job = self.job.clone();
                    inflight = Some(tokio::spawn(async move {
                        let _guard = guard;
                        job.process(frame).await;
                    }));
                }
            }
        }

        if let Some(h) = inflight.take() {
            h.abort();
        }
        info!(
            frames = self.job.completed.load(Ordering::Relaxed),
            busy_ticks,
            "detection loop stopped"
        );
    }
}

/// Loads the configured model, publishing progress on `status`.
///
/// `None` means detection stays disabled; it is not retried.
pub async fn load_model(cfg: DetectorConfig, status: watch::Sender<DetectorStatus>) -> Option<Arc<dyn InferenceEngine>> {
    status.send_replace(DetectorStatus::Loading);
    info!(model = %cfg.model_path.display(), "loading model");
    match load_engine(&cfg).await {
        Ok(engine) => {
            info!(engine = engine.name(), "model ready");
            status.send_replace(DetectorStatus::Ready);
            Some(engine)
        }
        Err(e) => {
            error!("model load failed: {e:#}");
            status.send_replace(DetectorStatus::Failed(format!("Failed to load model: {e:#}")));
            None
        }
    }
}
