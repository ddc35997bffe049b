/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Decoded pixels of the remote H.264 track.
//!
//! RTP packets are reassembled into Annex-B access units by webrtc-rs'
//! `SampleBuilder`, decoded with openh264 on a blocking thread and published
//! as the latest [`RawFrame`] of a [`RemoteVideoSurface`].

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::frame_source::VideoSurface;
use crate::preprocess::RawFrame;

const H264_CLOCK_RATE: u32 = 90_000;
/// Packets kept while waiting for a sequence gap to fill.
const MAX_LATE: u16 = 256;
const DECODE_QUEUE: usize = 32;

/// Counts what arrives on the remote video track.
#[derive(Default)]
pub struct RemoteTrackStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub tracks: AtomicU64,
}

impl RemoteTrackStats {
    pub fn record(&self, payload_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.packets.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }
}

/// The most recently decoded remote picture.
#[derive(Default)]
pub struct RemoteVideoSurface {
    frame: Mutex<Option<RawFrame>>,
    playing: AtomicBool,
    decoded: AtomicU64,
    corrupt: AtomicU64,
}

impl RemoteVideoSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: RawFrame) {
        *self.frame.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        self.decoded.fetch_add(1, Ordering::Relaxed);
        self.playing.store(true, Ordering::Release);
    }

    /// Forgets the last picture; the surface reads as paused until the next one.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.frame.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn decoded_frames(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn corrupt_units(&self) -> u64 {
        self.corrupt.load(Ordering::Relaxed)
    }
}

impl VideoSurface for RemoteVideoSurface {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0))
    }

    fn capture(&self) -> Result<RawFrame> {
        let mut frame = self
            .frame
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("no remote frame decoded yet"))?;
        frame.captured_at = Instant::now();
        Ok(frame)
    }
}

/// Reassembles RTP packets into Annex-B access units.
pub struct AccessUnits {
    builder: SampleBuilder<H264Packet>,
}

impl Default for AccessUnits {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessUnits {
    pub fn new() -> Self {
        Self {
            builder: SampleBuilder::new(MAX_LATE, H264Packet::default(), H264_CLOCK_RATE),
        }
    }

    /// Feeds one packet and returns every access unit it completed.
    pub fn push(&mut self, packet: Packet) -> Vec<Bytes> {
        self.builder.push(packet);
        let mut out = Vec::new();
        while let Some(sample) = self.builder.pop() {
            if !sample.data.is_empty() {
                out.push(sample.data);
            }
        }
        out
    }
}

pub trait FrameDecoder {
    /// Decodes one Annex-B access unit. `Ok(None)` while the decoder has no
    /// picture to show yet (parameter sets, buffering).
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawFrame>>;
}

pub struct H264Decoder {
    inner: Decoder,
}

impl H264Decoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Decoder::new().context("init h264 decoder")?,
        })
    }
}

impl FrameDecoder for H264Decoder {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawFrame>> {
        let mut latest = None;
        for nal in openh264::nal_units(access_unit) {
            if let Some(yuv) = self.inner.decode(nal).context("h264 decode")? {
                let (w, h) = yuv.dimensions();
                let mut rgba = vec![0u8; w * h * 4];
                yuv.write_rgba8(&mut rgba);
                latest = Some(RawFrame::new(w as u32, h as u32, rgba)?);
            }
        }
        Ok(latest)
    }
}

/// Decodes access units until the sending side closes. Blocks the thread.
pub fn decode_loop<D: FrameDecoder>(mut decoder: D, mut units: mpsc::Receiver<Bytes>, surface: &RemoteVideoSurface) {
    while let Some(unit) = units.blocking_recv() {
        match decoder.decode(&unit) {
            Ok(Some(frame)) => surface.publish(frame),
            Ok(None) => {}
            Err(e) => {
                surface.corrupt.fetch_add(1, Ordering::Relaxed);
                debug!("access unit dropped: {e:#}");
            }
        }
    }
}

/// Reads the remote H.264 track and keeps `surface` showing its latest picture.
pub async fn receive_h264(
    track: Arc<TrackRemote>,
    surface: Arc<RemoteVideoSurface>,
    stats: Arc<RemoteTrackStats>,
    cancel: CancellationToken,
) {
    stats.tracks.fetch_add(1, Ordering::Relaxed);
    info!(ssrc = track.ssrc(), "remote h264 track started");

    let (tx, rx) = mpsc::channel::<Bytes>(DECODE_QUEUE);
    let worker_surface = surface.clone();
    let worker = tokio::task::spawn_blocking(move || match H264Decoder::new() {
        Ok(decoder) => decode_loop(decoder, rx, &worker_surface),
        Err(e) => warn!("remote video cannot be decoded: {e:#}"),
    });

    let mut units = AccessUnits::new();
    'read: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            r = track.read_rtp() => match r {
                Ok((pkt, _)) => {
                    stats.record(pkt.payload.len());
                    for unit in units.push(pkt) {
                        // Decoder behind: skip ahead rather than stall RTP reads.
                        match tx.try_send(unit) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => debug!("decoder busy, access unit skipped"),
                            Err(mpsc::error::TrySendError::Closed(_)) => break 'read,
                        }
                    }
                }
                Err(e) => {
                    debug!("remote track ended: {e}");
                    break;
                }
            }
        }
    }

    drop(tx);
    if let Err(e) = worker.await {
        warn!("decoder thread: {e}");
    }
    surface.stop();
    info!(decoded = surface.decoded_frames(), corrupt = surface.corrupt_units(), "remote h264 track stopped");
}
