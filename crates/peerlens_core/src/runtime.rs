/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Role runners wiring signaling, negotiation and the detection pipeline.

use anyhow::{anyhow, Context, Result};
use peerlens_protocol::{ClientMsg, RelayMsg};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, OfferMode};
use crate::detection::Decoder;
use crate::frame_source::{FrameSlot, FrameSource, VideoSurface};
use crate::inference::InferenceEngine;
use crate::metrics::{BenchmarkOutcome, MetricsHarness};
use crate::negotiation::{NegotiationState, Negotiator, OfferRoute, Role, SessionPhase};
use crate::overlay::class_counts;
use crate::pipeline::{load_model, DetectionLoop, DetectorStatus, Detections};
use crate::server_mode::ServerOfferClient;
use crate::signaling::{self, SignalingClient};
use crate::remote_video::RemoteTrackStats;
use crate::webrtc_transport::{H264FileSource, WebrtcFactory};

fn spawn_status_log(role: &'static str, mut status: watch::Receiver<String>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                r = status.changed() => {
                    if r.is_err() {
                        break;
                    }
                    let s = status.borrow_and_update().clone();
                    info!(role, status = %s, "status");
                }
            }
        }
    });
}

fn spawn_detections_log(mut rx: watch::Receiver<Detections>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut last = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                r = rx.changed() => {
                    if r.is_err() {
                        break;
                    }
                    let boxes = rx.borrow_and_update().clone();
                    let summary: Vec<(&'static str, usize)> =
                        class_counts(&boxes).into_iter().map(|c| (c.label, c.count)).collect();
                    if summary != last {
                        debug!(?summary, "detections");
                        last = summary;
                    }
                }
            }
        }
    });
}

fn spawn_live_metrics_log(metrics: Arc<MetricsHarness>, remote: Arc<RemoteTrackStats>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let live = metrics.live();
                    let (rtp_packets, rtp_bytes) = remote.snapshot();
                    info!(
                        fps = live.fps,
                        median_ms = live.median_latency_ms,
                        p95_ms = live.p95_latency_ms,
                        total_frames = live.total_frames,
                        rtp_packets,
                        rtp_bytes,
                        "live metrics"
                    );
                }
            }
        }
    });
}

async fn run_benchmark(metrics: Arc<MetricsHarness>, secs: u64, out: PathBuf, cancel: CancellationToken) {
    metrics.start_benchmark();
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
    }
    match metrics.stop_benchmark() {
        BenchmarkOutcome::Finished(summary) => match summary.write_json(&out) {
            Ok(()) => info!(path = %out.display(), "benchmark written"),
            Err(e) => error!("benchmark export failed: {e:#}"),
        },
        BenchmarkOutcome::NotStarted => warn!("benchmark was not running"),
    }
}

/// Per-session capture and detection tasks. Cancelled as a unit.
struct MediaSession {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaSession {
    async fn stop(self) {
        self.cancel.cancel();
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaAction {
    Keep,
    Start,
    Stop,
    Restart,
}

/// What to do with the capture tasks given the session they were started for
/// and the latest negotiation phase. A connected phase of a different session
/// means the old one closed in between.
fn media_action(running: Option<u64>, phase: SessionPhase) -> MediaAction {
    let connected = phase.state == NegotiationState::Connected;
    match (running, connected) {
        (None, true) => MediaAction::Start,
        (None, false) => MediaAction::Keep,
        (Some(session), true) if session == phase.session => MediaAction::Keep,
        (Some(_), true) => MediaAction::Restart,
        (Some(_), false) => MediaAction::Stop,
    }
}

struct ReceiverPipeline {
    cfg: CoreConfig,
    surface: Arc<dyn VideoSurface>,
    metrics: Arc<MetricsHarness>,
    engine: Option<Arc<dyn InferenceEngine>>,
    benchmark_done: bool,
}

impl ReceiverPipeline {
    fn start(&mut self, parent: &CancellationToken) -> MediaSession {
        let cancel = parent.child_token();
        let slot = Arc::new(FrameSlot::new());
        let mut tasks = Vec::new();

        let source = FrameSource::new(self.surface.clone(), slot.clone(), self.cfg.capture_fps);
        tasks.push(tokio::spawn(source.run(cancel.clone())));

        if let Some(engine) = self.engine.clone() {
            let d = &self.cfg.detector;
            let dl = DetectionLoop::new(
                engine,
                Decoder::from_config(d),
                slot,
                self.metrics.clone(),
                (d.input_width, d.input_height),
                Duration::from_millis(self.cfg.detect_tick_ms),
            );
            spawn_detections_log(dl.subscribe(), cancel.clone());
            tasks.push(tokio::spawn(dl.run(cancel.clone())));

            if let (Some(secs), false) = (self.cfg.benchmark_secs, self.benchmark_done) {
                self.benchmark_done = true;
                tasks.push(tokio::spawn(run_benchmark(
                    self.metrics.clone(),
                    secs,
                    self.cfg.metrics_out.clone(),
                    cancel.clone(),
                )));
            }
        }
        MediaSession { cancel, tasks }
    }
}

/// Receiver role: initiates the session, runs detection over the decoded
/// remote video while connected. Returns when `shutdown` fires or signaling
/// is lost.
pub async fn run_receiver(cfg: CoreConfig, shutdown: CancellationToken) -> Result<()> {
    let cancel = shutdown.child_token();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let metrics = Arc::new(MetricsHarness::new());

    let factory = WebrtcFactory::new(&cfg, None)?;
    let remote_stats = factory.remote_stats();
    let surface: Arc<dyn VideoSurface> = factory.remote_surface();

    // Server mode never talks to the relay; the inbox sender is held so the
    // negotiator keeps running until shutdown.
    let (route, outbox, inbox, self_id, _hold_inbox, relay_task) = match cfg.mode {
        OfferMode::Peer => {
            let SignalingClient {
                self_id,
                outbox,
                inbox,
                task,
            } = signaling::connect(&cfg.signaling_url, cancel.clone()).await?;
            (OfferRoute::Relay, outbox, inbox, Some(self_id), None, Some(task))
        }
        OfferMode::Server => {
            let client = ServerOfferClient::new(&cfg.api_url)?;
            let (outbox, _) = mpsc::channel::<ClientMsg>(1);
            let (hold, inbox) = mpsc::channel::<RelayMsg>(1);
            (OfferRoute::Server(Arc::new(client)), outbox, inbox, None, Some(hold), None)
        }
    };

    let mut negotiator = Negotiator::new(Role::Initiator, Arc::new(factory), route, outbox.clone());
    if let Some(id) = self_id {
        negotiator.set_self_id(id);
    }
    spawn_status_log("receiver", negotiator.subscribe_status(), cancel.clone());
    negotiator.set_status(match cfg.mode {
        OfferMode::Peer => "Mode: PEER. Waiting for phone to connect...",
        OfferMode::Server => "Mode: SERVER. Connecting...",
    });
    let mut phase = negotiator.subscribe_phase();
    let negotiation = tokio::spawn(negotiator.run(inbox, cancel.clone()));
    if cfg.mode == OfferMode::Peer {
        outbox.send(ClientMsg::Join).await.context("send join")?;
    }

    let (model_status_tx, model_status) = watch::channel(DetectorStatus::Loading);
    let mut model_task = tokio::spawn(load_model(cfg.detector.clone(), model_status_tx));
    let engine = tokio::select! {
        _ = cancel.cancelled() => {
            model_task.abort();
            None
        }
        r = &mut model_task => r.unwrap_or_else(|e| {
            error!("model loader task failed: {e}");
            None
        }),
    };
    if let DetectorStatus::Failed(msg) = &*model_status.borrow() {
        warn!(%msg, "detection disabled");
    }
    spawn_live_metrics_log(metrics.clone(), remote_stats, cancel.clone());

    let mut pipeline = ReceiverPipeline {
        cfg: cfg.clone(),
        surface,
        metrics,
        engine,
        benchmark_done: false,
    };
    let mut media: Option<(u64, MediaSession)> = None;
    let mut current = *phase.borrow_and_update();
    loop {
        match media_action(media.as_ref().map(|(id, _)| *id), current) {
            MediaAction::Keep => {}
            MediaAction::Start => {
                info!(session = current.session, "media connected, starting capture");
                media = Some((current.session, pipeline.start(&cancel)));
            }
            MediaAction::Stop => {
                if let Some((session, m)) = media.take() {
                    info!(session, state = ?current.state, "session left connected, stopping capture");
                    m.stop().await;
                }
            }
            MediaAction::Restart => {
                if let Some((session, m)) = media.take() {
                    info!(old = session, new = current.session, "session replaced, restarting capture");
                    m.stop().await;
                }
                media = Some((current.session, pipeline.start(&cancel)));
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            r = phase.changed() => {
                if r.is_err() {
                    break;
                }
                current = *phase.borrow_and_update();
            }
        }
    }

    cancel.cancel();
    if let Some((_, m)) = media.take() {
        m.stop().await;
    }
    let _ = negotiation.await;
    if let Some(t) = relay_task {
        let _ = t.await;
    }
    info!("receiver stopped");
    Ok(())
}

/// Sender role: streams `media_path` to whichever peer offers.
pub async fn run_sender(cfg: CoreConfig, shutdown: CancellationToken) -> Result<()> {
    let path = cfg
        .media_path
        .clone()
        .ok_or_else(|| anyhow!("no media source configured (set media_path or PEERLENS_MEDIA_PATH)"))?;
    let media = H264FileSource::open(&path, cfg.media_fps).context("camera unavailable")?;
    info!(path = %path.display(), fps = cfg.media_fps, "media source ready");

    let cancel = shutdown.child_token();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let factory = WebrtcFactory::new(&cfg, Some(media))?;
    let SignalingClient {
        self_id,
        outbox,
        inbox,
        task: relay_task,
    } = signaling::connect(&cfg.signaling_url, cancel.clone()).await?;

    let mut negotiator = Negotiator::new(Role::Responder, Arc::new(factory), OfferRoute::Relay, outbox.clone());
    negotiator.set_self_id(self_id);
    spawn_status_log("sender", negotiator.subscribe_status(), cancel.clone());
    negotiator.set_status("Camera active. Waiting for desktop connection.");
    let negotiation = tokio::spawn(negotiator.run(inbox, cancel.clone()));
    outbox.send(ClientMsg::Join).await.context("send join")?;
    drop(outbox);

    let _ = negotiation.await;
    cancel.cancel();
    let _ = relay_task.await;
    info!("sender stopped");
    Ok(())
}
