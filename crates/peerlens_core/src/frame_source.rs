/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::preprocess::RawFrame;

/// Single-slot mailbox holding the newest captured frame.
///
/// `store` always overwrites; the detection loop never sees a backlog.
#[derive(Default)]
pub struct FrameSlot {
    frame: Mutex<Option<RawFrame>>,
    stored: AtomicU64,
    overwritten: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: RawFrame) {
        let mut g = self.frame.lock().unwrap_or_else(|e| e.into_inner());
        if g.replace(frame).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes and returns the newest frame, if one arrived since the last take.
    pub fn take(&self) -> Option<RawFrame> {
        self.frame.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn stored_count(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Frames replaced before anyone took them.
    pub fn dropped_count(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

/// The live video the Frame Source samples from.
///
/// [`RemoteVideoSurface`](crate::remote_video::RemoteVideoSurface) shows the
/// decoded remote track; [`StillImageSurface`] serves a fixed picture.
pub trait VideoSurface: Send + Sync {
    fn is_playing(&self) -> bool;

    /// Native `(width, height)`; zero while no frame has been decoded yet.
    fn dimensions(&self) -> (u32, u32);

    fn capture(&self) -> Result<RawFrame>;
}

pub struct StillImageSurface {
    frame: RawFrame,
}

impl StillImageSurface {
    pub fn new(frame: RawFrame) -> Self {
        Self { frame }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(RawFrame::open(path)?))
    }
}

impl VideoSurface for StillImageSurface {
    fn is_playing(&self) -> bool {
        true
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }

    fn capture(&self) -> Result<RawFrame> {
        let mut frame = self.frame.clone();
        frame.captured_at = Instant::now();
        Ok(frame)
    }
}

/// Samples a [`VideoSurface`] into a [`FrameSlot`] at display cadence.
pub struct FrameSource {
    surface: Arc<dyn VideoSurface>,
    slot: Arc<FrameSlot>,
    period: Duration,
}

impl FrameSource {
    pub fn new(surface: Arc<dyn VideoSurface>, slot: Arc<FrameSlot>, fps: u32) -> Self {
        let fps = fps.clamp(1, 240);
        Self {
            surface,
            slot,
            period: Duration::from_micros(1_000_000 / fps as u64),
        }
    }

    /// One capture attempt. Returns whether a frame was stored.
    pub fn tick(&self) -> bool {
        if !self.surface.is_playing() {
            return false;
        }
        let (w, h) = self.surface.dimensions();
        if w == 0 || h == 0 {
            return false;
        }
        match self.surface.capture() {
            Ok(frame) => {
                self.slot.store(frame);
                true
            }
            Err(e) => {
                debug!("frame capture failed: {e:#}");
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_ms = self.period.as_millis() as u64, "frame source started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.tick();
                }
            }
        }
        info!(
            stored = self.slot.stored_count(),
            dropped = self.slot.dropped_count(),
            "frame source stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn tagged(tag: u8) -> RawFrame {
        RawFrame::new(2, 2, vec![tag; 16]).unwrap()
    }

    struct Toggle {
        playing: AtomicBool,
        dims: (u32, u32),
    }

    impl VideoSurface for Toggle {
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        fn dimensions(&self) -> (u32, u32) {
            self.dims
        }

        fn capture(&self) -> Result<RawFrame> {
            Ok(tagged(9))
        }
    }

    #[test]
    fn slot_keeps_only_newest() {
        let slot = FrameSlot::new();
        slot.store(tagged(1));
        slot.store(tagged(2));
        slot.store(tagged(3));
        let f = slot.take().unwrap();
        assert_eq!(f.rgba[0], 3);
        assert!(slot.take().is_none());
        assert_eq!(slot.stored_count(), 3);
        assert_eq!(slot.dropped_count(), 2);
    }

    #[test]
    fn paused_or_empty_surface_is_skipped() {
        let slot = Arc::new(FrameSlot::new());
        let surface = Arc::new(Toggle {
            playing: AtomicBool::new(false),
            dims: (2, 2),
        });
        let src = FrameSource::new(surface.clone(), slot.clone(), 60);
        assert!(!src.tick());
        surface.playing.store(true, Ordering::SeqCst);
        assert!(src.tick());
        assert_eq!(slot.take().unwrap().rgba[0], 9);

        let empty = Arc::new(Toggle {
            playing: AtomicBool::new(true),
            dims: (0, 0),
        });
        let src = FrameSource::new(empty, slot.clone(), 60);
        assert!(!src.tick());
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let slot = Arc::new(FrameSlot::new());
        let surface = Arc::new(StillImageSurface::new(tagged(5)));
        let src = FrameSource::new(surface, slot.clone(), 240);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(src.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(slot.stored_count() > 0);
        assert_eq!(slot.take().unwrap().rgba[0], 5);
    }
}
