/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use peerlens_protocol::{IceCandidate, SessionDescription};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::h264_reader::{H264Reader, NalUnitType, NAL};
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CoreConfig;
use crate::negotiation::{EventSink, PeerTransport, Role, TransportEvent, TransportFactory, TransportState};
use crate::remote_video::{receive_h264, RemoteTrackStats, RemoteVideoSurface};

fn build_ice_servers(cfg: &CoreConfig) -> Vec<RTCIceServer> {
    if cfg.ice_urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: cfg.ice_urls.clone(),
        username: cfg.ice_username.clone().unwrap_or_default(),
        credential: cfg.ice_credential.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    serde_json::from_value(desc.to_value()).context("session description")
}

fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let v = serde_json::to_value(desc).context("session description")?;
    SessionDescription::from_value(v).context("session description")
}

fn candidate_from_rtc(c: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = c.to_json().context("candidate to json")?;
    let v = serde_json::to_value(&init).context("candidate")?;
    IceCandidate::from_value(v).context("candidate")
}

fn map_state(st: RTCPeerConnectionState) -> TransportState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Annex-B H.264 file, looped, used as the sender's camera.
#[derive(Debug, Clone)]
pub struct H264FileSource {
    path: PathBuf,
    frame_interval: Duration,
}

fn h264_reader(path: &Path) -> Result<H264Reader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("open media {}", path.display()))?;
    Ok(H264Reader::new(BufReader::new(file), 1_048_576))
}

fn is_picture(nal: &NAL) -> bool {
    matches!(nal.unit_type, NalUnitType::CodedSliceIdr | NalUnitType::CodedSliceNonIdr)
}

impl H264FileSource {
    /// Opens the file and checks that it starts with an H.264 NAL unit.
    pub fn open(path: &Path, fps: u32) -> Result<Self> {
        let mut reader = h264_reader(path)?;
        reader
            .next_nal()
            .map_err(|e| anyhow!("{} is not an Annex-B H.264 stream: {e}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            frame_interval: Duration::from_micros(1_000_000 / fps.clamp(1, 120) as u64),
        })
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    async fn stream(self, track: Arc<TrackLocalStaticSample>, cancel: CancellationToken) {
        let mut frames = 0u64;
        let mut tick = tokio::time::interval(self.frame_interval);
        'outer: while !cancel.is_cancelled() {
            let mut reader = match h264_reader(&self.path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %self.path.display(), "media reopen failed: {e:#}");
                    break;
                }
            };
            let pass_start = frames;
            // End of file (or a broken tail) starts the clip over.
            while let Ok(nal) = reader.next_nal() {
                let picture = is_picture(&nal);
                if picture {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        _ = tick.tick() => {}
                    }
                }
                // Parameter sets share the timestamp of the picture that follows.
                let sample = Sample {
                    data: nal.data.freeze(),
                    duration: if picture { self.frame_interval } else { Duration::ZERO },
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("write sample: {e}");
                }
                if picture {
                    frames += 1;
                }
            }
            if frames == pass_start {
                warn!(path = %self.path.display(), "media holds no pictures");
                break;
            }
        }
        info!(frames, "media stream stopped");
    }
}

async fn drain_remote(track: Arc<TrackRemote>, stats: Arc<RemoteTrackStats>, cancel: CancellationToken) {
    stats.tracks.fetch_add(1, Ordering::Relaxed);
    warn!(mime = %track.codec().capability.mime_type, ssrc = track.ssrc(), "remote track is not h264, counting packets only");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            r = track.read_rtp() => match r {
                Ok((pkt, _)) => stats.record(pkt.payload.len()),
                Err(e) => {
                    debug!("remote track ended: {e}");
                    break;
                }
            }
        }
    }
}

pub struct WebrtcFactory {
    api: API,
    cfg: RTCConfiguration,
    media: Option<H264FileSource>,
    remote_stats: Arc<RemoteTrackStats>,
    remote_surface: Arc<RemoteVideoSurface>,
}

impl WebrtcFactory {
    pub fn new(cfg: &CoreConfig, media: Option<H264FileSource>) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut m).context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            cfg: RTCConfiguration {
                ice_servers: build_ice_servers(cfg),
                ..Default::default()
            },
            media,
            remote_stats: Arc::new(RemoteTrackStats::default()),
            remote_surface: Arc::new(RemoteVideoSurface::new()),
        })
    }

    pub fn remote_stats(&self) -> Arc<RemoteTrackStats> {
        self.remote_stats.clone()
    }

    /// Pictures decoded from whichever remote track is currently live.
    pub fn remote_surface(&self) -> Arc<RemoteVideoSurface> {
        self.remote_surface.clone()
    }
}

#[async_trait]
impl TransportFactory for WebrtcFactory {
    async fn create(&self, role: Role, events: EventSink) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.cfg.clone())
                .await
                .context("new peer connection")?,
        );
        let cancel = CancellationToken::new();
        let connected = Arc::new(Notify::new());

        match role {
            Role::Initiator => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .context("add recvonly transceiver")?;

                let stats = self.remote_stats.clone();
                let surface = self.remote_surface.clone();
                let cancel2 = cancel.clone();
                pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                    if track.codec().capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
                        tokio::spawn(receive_h264(track, surface.clone(), stats.clone(), cancel2.clone()));
                    } else {
                        tokio::spawn(drain_remote(track, stats.clone(), cancel2.clone()));
                    }
                    Box::pin(async {})
                }));
            }
            Role::Responder => {
                let media = self.media.clone().context("no local media to send")?;
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        ..Default::default()
                    },
                    "video".to_owned(),
                    "peerlens".to_owned(),
                ));
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .context("add local track")?;

                // RTCP has to be read for interceptors to run.
                let cancel2 = cancel.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    loop {
                        tokio::select! {
                            _ = cancel2.cancelled() => break,
                            r = sender.read(&mut buf) => if r.is_err() { break },
                        }
                    }
                });

                let connected2 = connected.clone();
                let cancel3 = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel3.cancelled() => return,
                        _ = connected2.notified() => {}
                    }
                    media.stream(track, cancel3).await;
                });
            }
        }

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                match c {
                    Some(c) => match candidate_from_rtc(&c) {
                        Ok(c) => ev.emit(TransportEvent::LocalCandidate(Some(c))),
                        Err(e) => warn!("local candidate dropped: {e:#}"),
                    },
                    None => ev.emit(TransportEvent::LocalCandidate(None)),
                }
            })
        }));

        let ev = events;
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let ev = ev.clone();
            let connected = connected.clone();
            Box::pin(async move {
                let st = map_state(st);
                if st == TransportState::Connected {
                    connected.notify_one();
                }
                ev.emit(TransportEvent::StateChanged(st));
            })
        }));

        Ok(Arc::new(WebrtcTransport { pc, cancel }))
    }
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .context("set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("set remote description")
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(&desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.to_value()).context("candidate")?;
        self.pc.add_ice_candidate(init).await.context("add ice candidate")
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.pc.close().await.context("close peer connection")
    }
}
