/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Offer/answer/candidate exchange for the single peer session a device holds.
//!
//! The [`Negotiator`] owns the session and its candidate buffer and is driven
//! from one task: relay messages and transport callbacks are funnelled into
//! [`Negotiator::run`] and applied in arrival order.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use peerlens_protocol::{ClientMsg, IceCandidate, RelayMsg, SdpKind, SessionDescription};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Candidates a responder holds before its first offer arrives.
const MAX_ORPHAN_CANDIDATES: usize = 64;

/// Peer identity used for the HTTP offer exchange.
pub const SERVER_PEER: &str = "server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    Connected,
    Closed,
}

/// State tagged with the session it belongs to. Observers that only see the
/// latest value can still tell that a session was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPhase {
    /// 0 until the first session opens.
    pub session: u64,
    pub state: NegotiationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGathering {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Discovers the peer and sends the offer (the receiver).
    Initiator,
    /// Answers with its media attached (the sender).
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A gathered local candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

/// Where a transport reports its callbacks. Tagged with the session it belongs
/// to so late events from a torn-down transport are ignored.
#[derive(Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(SessionEvent {
            session: self.session,
            event,
        });
    }
}

/// The media transport behind one peer session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Current local description, including candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport for `role`. A responder transport comes with its
    /// local media already attached.
    async fn create(&self, role: Role, events: EventSink) -> Result<Arc<dyn PeerTransport>>;
}

/// HTTP-style offer exchange used instead of the relay in server mode.
#[async_trait]
pub trait OfferEndpoint: Send + Sync {
    async fn exchange(&self, offer: &SessionDescription) -> Result<SessionDescription>;
}

#[derive(Clone)]
pub enum OfferRoute {
    Relay,
    Server(Arc<dyn OfferEndpoint>),
}

struct PeerSession {
    id: u64,
    peer_id: String,
    transport: Arc<dyn PeerTransport>,
    ice: IceGathering,
    remote_applied: bool,
    offer_posted: bool,
    pending_candidates: Vec<IceCandidate>,
}

pub struct Negotiator {
    role: Role,
    factory: Arc<dyn TransportFactory>,
    route: OfferRoute,
    outbox: mpsc::Sender<ClientMsg>,
    self_id: Option<String>,

    state: NegotiationState,
    state_tx: watch::Sender<NegotiationState>,
    phase_tx: watch::Sender<SessionPhase>,
    status_tx: watch::Sender<String>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: Option<PeerSession>,
    orphan_candidates: Vec<IceCandidate>,
    next_session: u64,
}

enum Step {
    Stop,
    Relay(Option<RelayMsg>),
    Transport(SessionEvent),
}

impl Negotiator {
    pub fn new(
        role: Role,
        factory: Arc<dyn TransportFactory>,
        route: OfferRoute,
        outbox: mpsc::Sender<ClientMsg>,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (phase_tx, _) = watch::channel(SessionPhase {
            session: 0,
            state: NegotiationState::Idle,
        });
        let (status_tx, _) = watch::channel("Initializing...".to_string());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            role,
            factory,
            route,
            outbox,
            self_id: None,
            state: NegotiationState::Idle,
            state_tx,
            phase_tx,
            status_tx,
            events_tx,
            events_rx,
            session: None,
            orphan_candidates: Vec::new(),
            next_session: 1,
        }
    }

    pub fn set_self_id(&mut self, id: String) {
        self.self_id = Some(id);
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status_tx.subscribe()
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.peer_id.as_str())
    }

    pub fn ice_gathering(&self) -> Option<IceGathering> {
        self.session.as_ref().map(|s| s.ice)
    }

    pub fn pending_candidates(&self) -> usize {
        self.session.as_ref().map(|s| s.pending_candidates.len()).unwrap_or(0) + self.orphan_candidates.len()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        debug!(%status, "status");
        self.status_tx.send_replace(status);
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        info!(role = ?self.role, from = ?self.state, to = ?next, "negotiation state");
        self.state = next;
        self.state_tx.send_replace(next);
        self.phase_tx.send_replace(SessionPhase {
            session: self.next_session - 1,
            state: next,
        });
    }

    async fn send(&self, msg: ClientMsg) {
        let kind = msg.kind();
        if self.outbox.send(msg).await.is_err() {
            warn!(kind, "signaling outbox closed, message dropped");
        }
    }

    async fn open_session(&mut self, peer_id: &str) -> Result<()> {
        let id = self.next_session;
        self.next_session += 1;
        let sink = EventSink {
            session: id,
            tx: self.events_tx.clone(),
        };
        let transport = self.factory.create(self.role, sink).await.context("create transport")?;
        self.session = Some(PeerSession {
            id,
            peer_id: peer_id.to_string(),
            transport,
            ice: IceGathering::New,
            remote_applied: false,
            offer_posted: false,
            pending_candidates: std::mem::take(&mut self.orphan_candidates),
        });
        info!(peer = %peer_id, session = id, "peer session opened");
        Ok(())
    }

    /// Tears the session down and releases its transport. Idempotent.
    pub async fn close_session(&mut self, reason: &str) {
        let Some(s) = self.session.take() else {
            return;
        };
        if let Err(e) = s.transport.close().await {
            debug!(peer = %s.peer_id, "transport close: {e:#}");
        }
        self.orphan_candidates.clear();
        info!(peer = %s.peer_id, session = s.id, reason, "peer session closed");
        self.set_state(NegotiationState::Closed);
    }

    async fn fail(&mut self, status: &str, err: anyhow::Error) {
        warn!(role = ?self.role, "{status}: {err:#}");
        self.set_status(format!("Error: {status}"));
        self.close_session("negotiation failure").await;
    }

    async fn replay_pending(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let buffered = std::mem::take(&mut s.pending_candidates);
        if buffered.is_empty() {
            return;
        }
        info!(peer = %s.peer_id, count = buffered.len(), "replaying buffered candidates");
        for c in buffered {
            if let Err(e) = s.transport.add_ice_candidate(c).await {
                warn!(peer = %s.peer_id, "buffered candidate rejected: {e:#}");
            }
        }
    }

    pub async fn handle_relay(&mut self, msg: RelayMsg) {
        match msg {
            RelayMsg::Welcome { id } => {
                info!(id = %id, "relay assigned identity");
                self.set_self_id(id);
            }
            RelayMsg::ExistingPeers { peers } => self.on_existing_peers(peers).await,
            RelayMsg::PeerJoined { peer } => self.on_peer_discovered(&peer).await,
            RelayMsg::PeerLeft { peer } => self.on_peer_left(&peer).await,
            RelayMsg::Offer { from, offer } => self.on_offer(&from, offer).await,
            RelayMsg::Answer { answer } => self.on_answer(answer).await,
            RelayMsg::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            RelayMsg::Error { message } => warn!(%message, "relay error"),
        }
    }

    pub async fn on_existing_peers(&mut self, peers: Vec<String>) {
        if let Some(first) = peers.first() {
            self.on_peer_discovered(first).await;
        }
    }

    /// Initiator only: start negotiating with a newly seen peer.
    pub async fn on_peer_discovered(&mut self, peer: &str) {
        if self.role != Role::Initiator || matches!(self.route, OfferRoute::Server(_)) {
            return;
        }
        if let Some(s) = &self.session {
            debug!(peer = %peer, current = %s.peer_id, "session exists, ignoring discovered peer");
            return;
        }
        self.set_status("Peer detected! Creating WebRTC connection...");
        if let Err(e) = self.start_offer(peer).await {
            self.fail("Failed to create WebRTC offer.", e).await;
        }
    }

    async fn start_offer(&mut self, peer: &str) -> Result<SessionDescription> {
        self.open_session(peer).await?;
        self.set_state(NegotiationState::Offering);
        let transport = self.transport()?;
        let offer = transport.create_offer().await.context("create offer")?;
        transport
            .set_local_description(offer.clone())
            .await
            .context("set local description")?;
        self.set_state(NegotiationState::AwaitingAnswer);
        if matches!(self.route, OfferRoute::Relay) {
            self.send(ClientMsg::Offer {
                target: peer.to_string(),
                from: self.self_id.clone(),
                offer: offer.to_value(),
            })
            .await;
        }
        Ok(offer)
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>> {
        self.session
            .as_ref()
            .map(|s| s.transport.clone())
            .context("no active session")
    }

    /// Server mode: builds the offer locally. It is posted once candidate
    /// gathering completes.
    pub async fn start_server_session(&mut self) {
        if self.role != Role::Initiator || self.session.is_some() {
            return;
        }
        self.set_status("Connecting to detection server...");
        if let Err(e) = self.start_offer(SERVER_PEER).await {
            self.fail("Failed to create WebRTC offer.", e).await;
        }
    }

    async fn post_offer(&mut self, endpoint: Arc<dyn OfferEndpoint>) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.offer_posted = true;
        let transport = s.transport.clone();
        let Some(offer) = transport.local_description().await else {
            self.fail("Failed to connect to server.", anyhow::anyhow!("no local description")).await;
            return;
        };
        let result = async {
            let answer = endpoint.exchange(&offer).await?;
            transport
                .set_remote_description(answer)
                .await
                .context("set remote description")
        }
        .await;
        match result {
            Ok(()) => {
                if let Some(s) = self.session.as_mut() {
                    s.remote_applied = true;
                }
                self.replay_pending().await;
            }
            Err(e) => self.fail("Failed to connect to server.", e).await,
        }
    }

    /// Responder only. A new offer always replaces the current session.
    pub async fn on_offer(&mut self, from: &str, offer: Value) {
        if self.role != Role::Responder {
            debug!(from = %from, "initiator ignores offers");
            return;
        }
        let offer = match SessionDescription::from_value(offer) {
            Ok(o) if o.kind == SdpKind::Offer => o,
            Ok(o) => {
                warn!(from = %from, kind = ?o.kind, "expected an offer");
                return;
            }
            Err(e) => {
                warn!(from = %from, "malformed offer: {e}");
                return;
            }
        };
        if self.session.is_some() {
            self.close_session("replaced by new offer").await;
            self.set_state(NegotiationState::Idle);
        }
        self.set_status("Received offer, creating answer...");
        match self.answer_offer(from, offer).await {
            Ok(()) => self.set_status("Streaming video to peer."),
            Err(e) => self.fail("Failed to establish WebRTC connection.", e).await,
        }
    }

    async fn answer_offer(&mut self, from: &str, offer: SessionDescription) -> Result<()> {
        self.open_session(from).await?;
        let transport = self.transport()?;
        transport
            .set_remote_description(offer)
            .await
            .context("set remote description")?;
        if let Some(s) = self.session.as_mut() {
            s.remote_applied = true;
        }
        self.replay_pending().await;
        let answer = transport.create_answer().await.context("create answer")?;
        transport
            .set_local_description(answer.clone())
            .await
            .context("set local description")?;
        self.send(ClientMsg::Answer {
            target: from.to_string(),
            answer: answer.to_value(),
        })
        .await;
        Ok(())
    }

    /// Initiator only.
    pub async fn on_answer(&mut self, answer: Value) {
        if self.role != Role::Initiator || self.state != NegotiationState::AwaitingAnswer {
            debug!(state = ?self.state, "unexpected answer ignored");
            return;
        }
        let Some(transport) = self.session.as_ref().map(|s| s.transport.clone()) else {
            return;
        };
        let result = async {
            let answer = SessionDescription::from_value(answer).context("malformed answer")?;
            transport
                .set_remote_description(answer)
                .await
                .context("set remote description")
        }
        .await;
        match result {
            Ok(()) => {
                if let Some(s) = self.session.as_mut() {
                    s.remote_applied = true;
                }
                self.replay_pending().await;
            }
            Err(e) => self.fail("Failed to apply WebRTC answer.", e).await,
        }
    }

    /// Applies the candidate now if a remote description is in place,
    /// otherwise buffers it for replay.
    pub async fn on_remote_candidate(&mut self, candidate: Value) {
        let candidate = match IceCandidate::from_value(candidate) {
            Ok(c) => c,
            Err(e) => {
                warn!("malformed ice candidate: {e}");
                return;
            }
        };
        match self.session.as_mut() {
            Some(s) if s.remote_applied => {
                if let Err(e) = s.transport.add_ice_candidate(candidate).await {
                    warn!(peer = %s.peer_id, "add ice candidate failed: {e:#}");
                }
            }
            Some(s) => {
                s.pending_candidates.push(candidate);
                debug!(peer = %s.peer_id, buffered = s.pending_candidates.len(), "candidate buffered");
            }
            // Once any session has existed, a candidate with nowhere to go
            // belongs to a peer that already left.
            None if self.role == Role::Initiator || self.next_session > 1 => {
                debug!("candidate without a session dropped");
            }
            None => {
                if self.orphan_candidates.len() >= MAX_ORPHAN_CANDIDATES {
                    self.orphan_candidates.remove(0);
                }
                self.orphan_candidates.push(candidate);
                debug!(buffered = self.orphan_candidates.len(), "candidate buffered before session");
            }
        }
    }

    pub async fn on_peer_left(&mut self, peer: &str) {
        if self.peer_id() == Some(peer) {
            self.set_status("Peer disconnected.");
            self.close_session("peer left").await;
        }
    }

    pub async fn on_transport_event(&mut self, ev: SessionEvent) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.id != ev.session {
            debug!(session = ev.session, "event from stale transport ignored");
            return;
        }
        match ev.event {
            TransportEvent::LocalCandidate(Some(c)) => {
                s.ice = IceGathering::Gathering;
                if matches!(self.route, OfferRoute::Relay) {
                    let target = s.peer_id.clone();
                    self.send(ClientMsg::IceCandidate {
                        target,
                        candidate: c.to_value(),
                    })
                    .await;
                }
            }
            TransportEvent::LocalCandidate(None) => {
                s.ice = IceGathering::Complete;
                debug!(peer = %s.peer_id, "ice gathering complete");
                let post = !s.offer_posted && self.state == NegotiationState::AwaitingAnswer;
                if let (true, OfferRoute::Server(endpoint)) = (post, self.route.clone()) {
                    self.post_offer(endpoint).await;
                }
            }
            TransportEvent::StateChanged(ts) => {
                let remote_applied = s.remote_applied;
                self.set_status(format!("ICE state: {ts}"));
                match ts {
                    TransportState::Connected if remote_applied => {
                        self.set_state(NegotiationState::Connected);
                        self.set_status("Video stream connected!");
                    }
                    TransportState::Failed => {
                        self.fail("Peer connection failed.", anyhow::anyhow!("transport failed")).await;
                    }
                    TransportState::Closed => self.close_session("transport closed").await,
                    _ => {}
                }
            }
        }
    }

    /// Closes the session (if any) and stops accepting events.
    pub async fn close(&mut self) {
        self.close_session("shutdown").await;
        self.set_state(NegotiationState::Closed);
    }

    /// Drives the negotiator until `cancel` fires or the relay inbox ends.
    /// The session is closed on every exit path.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<RelayMsg>, cancel: CancellationToken) {
        if matches!(self.route, OfferRoute::Server(_)) {
            self.start_server_session().await;
        }
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                m = inbox.recv() => Step::Relay(m),
                Some(ev) = self.events_rx.recv() => Step::Transport(ev),
            };
            match step {
                Step::Stop => break,
                Step::Relay(None) => {
                    self.set_status("Signaling connection lost.");
                    break;
                }
                Step::Relay(Some(msg)) => self.handle_relay(msg).await,
                Step::Transport(ev) => self.on_transport_event(ev).await,
            }
        }
        self.close().await;
    }

    /// Next queued transport event, for callers driving the negotiator by hand.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
        remote: Mutex<Option<SessionDescription>>,
        applied: Mutex<Vec<IceCandidate>>,
        fail_answer: bool,
    }

    impl FakeTransport {
        fn log(&self, s: &str) {
            self.calls.lock().unwrap().push(s.to_string());
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.log("create_offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.log("create_answer");
            if self.fail_answer {
                return Err(anyhow!("no codecs in common"));
            }
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
            self.log("set_local");
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            self.log("set_remote");
            *self.remote.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            Some(SessionDescription::offer("v=0 offer a=candidate"))
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if self.remote.lock().unwrap().is_none() {
                return Err(anyhow!("remote description not set"));
            }
            self.applied.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log("close");
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        fail_answer: bool,
        made: Mutex<Vec<(Role, Arc<FakeTransport>, EventSink)>>,
    }

    impl FakeFactory {
        fn last(&self) -> (Arc<FakeTransport>, EventSink) {
            let g = self.made.lock().unwrap();
            let (_, t, s) = g.last().unwrap();
            (t.clone(), s.clone())
        }

        fn count(&self) -> usize {
            self.made.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(&self, role: Role, events: EventSink) -> Result<Arc<dyn PeerTransport>> {
            let t = Arc::new(FakeTransport {
                fail_answer: self.fail_answer,
                ..Default::default()
            });
            self.made.lock().unwrap().push((role, t.clone(), events));
            Ok(t)
        }
    }

    struct FakeServer;

    #[async_trait]
    impl OfferEndpoint for FakeServer {
        async fn exchange(&self, offer: &SessionDescription) -> Result<SessionDescription> {
            assert!(offer.sdp.contains("a=candidate"));
            Ok(SessionDescription::answer("v=0 server"))
        }
    }

    fn cand(n: u32) -> Value {
        json!({"candidate": format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"), "sdpMid": "0", "sdpMLineIndex": 0})
    }

    fn negotiator(role: Role, factory: Arc<FakeFactory>) -> (Negotiator, mpsc::Receiver<ClientMsg>) {
        let (tx, rx) = mpsc::channel(32);
        (Negotiator::new(role, factory, OfferRoute::Relay, tx), rx)
    }

    async fn pump(n: &mut Negotiator) {
        while let Ok(ev) = n.events_rx.try_recv() {
            n.on_transport_event(ev).await;
        }
    }

    #[tokio::test]
    async fn initiator_offers_to_discovered_peer() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, mut out) = negotiator(Role::Initiator, factory.clone());
        n.handle_relay(RelayMsg::Welcome { id: "me".into() }).await;
        n.handle_relay(RelayMsg::PeerJoined { peer: "phone".into() }).await;

        assert_eq!(n.state(), NegotiationState::AwaitingAnswer);
        match out.recv().await.unwrap() {
            ClientMsg::Offer { target, from, offer } => {
                assert_eq!(target, "phone");
                assert_eq!(from.as_deref(), Some("me"));
                assert_eq!(offer["type"], "offer");
            }
            other => panic!("unexpected {other:?}"),
        }
        let (t, _) = factory.last();
        assert_eq!(*t.calls.lock().unwrap(), vec!["create_offer", "set_local"]);
    }

    #[tokio::test]
    async fn initiator_ignores_second_peer() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, _out) = negotiator(Role::Initiator, factory.clone());
        n.on_existing_peers(vec!["a".into(), "b".into()]).await;
        n.on_peer_discovered("c").await;
        assert_eq!(factory.count(), 1);
        assert_eq!(n.peer_id(), Some("a"));
    }

    #[tokio::test]
    async fn candidate_before_answer_is_replayed_and_connects() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, mut out) = negotiator(Role::Initiator, factory.clone());
        let mut state = n.subscribe_state();
        n.on_peer_discovered("phone").await;
        let _offer = out.recv().await.unwrap();

        n.on_remote_candidate(cand(1)).await;
        let (t, sink) = factory.last();
        assert!(t.applied.lock().unwrap().is_empty());
        assert_eq!(n.pending_candidates(), 1);

        n.on_answer(json!({"type": "answer", "sdp": "v=0 answer"})).await;
        assert_eq!(t.applied.lock().unwrap().len(), 1);
        assert_eq!(n.pending_candidates(), 0);

        n.on_remote_candidate(cand(2)).await;
        assert_eq!(t.applied.lock().unwrap().len(), 2);

        sink.emit(TransportEvent::StateChanged(TransportState::Connecting));
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        assert_eq!(n.state(), NegotiationState::Connected);
        assert_eq!(*state.borrow_and_update(), NegotiationState::Connected);
        assert_eq!(*n.subscribe_status().borrow(), "Video stream connected!");
    }

    #[tokio::test]
    async fn candidate_before_any_session_reaches_responder() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, mut out) = negotiator(Role::Responder, factory.clone());
        n.on_remote_candidate(cand(7)).await;
        assert_eq!(n.pending_candidates(), 1);

        n.on_offer("desk", json!({"type": "offer", "sdp": "v=0 offer"})).await;
        let (t, sink) = factory.last();
        assert_eq!(t.applied.lock().unwrap().len(), 1);
        assert_eq!(
            *t.calls.lock().unwrap(),
            vec!["set_remote", "create_answer", "set_local"]
        );
        match out.recv().await.unwrap() {
            ClientMsg::Answer { target, answer } => {
                assert_eq!(target, "desk");
                assert_eq!(answer["type"], "answer");
            }
            other => panic!("unexpected {other:?}"),
        }

        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn late_candidate_from_departed_peer_is_not_replayed() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, mut out) = negotiator(Role::Initiator, factory.clone());
        n.on_peer_discovered("a").await;
        let _offer = out.recv().await.unwrap();
        n.on_answer(json!({"type": "answer", "sdp": "v=0 answer"})).await;

        n.on_peer_left("a").await;
        n.on_remote_candidate(cand(9)).await;
        assert_eq!(n.pending_candidates(), 0);

        n.on_peer_discovered("b").await;
        let _offer = out.recv().await.unwrap();
        n.on_answer(json!({"type": "answer", "sdp": "v=0 answer"})).await;
        let (t, _) = factory.last();
        assert_eq!(n.peer_id(), Some("b"));
        assert!(t.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn responder_drops_candidates_between_sessions() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, _out) = negotiator(Role::Responder, factory.clone());
        n.on_offer("a", json!({"type": "offer", "sdp": "v=0"})).await;
        n.on_peer_left("a").await;
        n.on_remote_candidate(cand(4)).await;
        assert_eq!(n.pending_candidates(), 0);

        n.on_offer("b", json!({"type": "offer", "sdp": "v=0"})).await;
        let (t, _) = factory.last();
        assert!(t.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_candidates_trickle_to_peer() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, mut out) = negotiator(Role::Initiator, factory.clone());
        n.on_peer_discovered("phone").await;
        let _offer = out.recv().await.unwrap();
        let (_, sink) = factory.last();
        let c = IceCandidate::from_value(cand(3)).unwrap();
        sink.emit(TransportEvent::LocalCandidate(Some(c)));
        sink.emit(TransportEvent::LocalCandidate(None));
        pump(&mut n).await;
        match out.recv().await.unwrap() {
            ClientMsg::IceCandidate { target, candidate } => {
                assert_eq!(target, "phone");
                assert_eq!(candidate["sdpMLineIndex"], 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(n.ice_gathering(), Some(IceGathering::Complete));
    }

    #[tokio::test]
    async fn answer_failure_closes_without_retry() {
        let factory = Arc::new(FakeFactory {
            fail_answer: true,
            ..Default::default()
        });
        let (mut n, mut out) = negotiator(Role::Responder, factory.clone());
        n.on_offer("desk", json!({"type": "offer", "sdp": "v=0"})).await;
        assert_eq!(n.state(), NegotiationState::Closed);
        assert!(n.peer_id().is_none());
        assert!(n.subscribe_status().borrow().starts_with("Error:"));
        assert!(out.try_recv().is_err());
        let (t, _) = factory.last();
        assert!(t.calls.lock().unwrap().contains(&"close".to_string()));
        assert_eq!(factory.count(), 1);
    }

    #[tokio::test]
    async fn stale_and_closed_events_are_ignored() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, _out) = negotiator(Role::Responder, factory.clone());
        n.on_offer("a", json!({"type": "offer", "sdp": "v=0"})).await;
        let (old, old_sink) = factory.last();
        n.on_offer("b", json!({"type": "offer", "sdp": "v=0"})).await;
        assert!(old.calls.lock().unwrap().contains(&"close".to_string()));
        assert_eq!(n.peer_id(), Some("b"));

        old_sink.emit(TransportEvent::StateChanged(TransportState::Failed));
        pump(&mut n).await;
        assert_eq!(n.peer_id(), Some("b"));

        n.on_peer_left("b").await;
        assert_eq!(n.state(), NegotiationState::Closed);
        let (_, sink) = factory.last();
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        assert_eq!(n.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn phase_tells_replaced_session_apart() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, _out) = negotiator(Role::Responder, factory.clone());
        let mut phase = n.subscribe_phase();

        n.on_offer("a", json!({"type": "offer", "sdp": "v=0"})).await;
        let (_, sink) = factory.last();
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        let first = *phase.borrow_and_update();
        assert_eq!(first.state, NegotiationState::Connected);

        n.on_offer("b", json!({"type": "offer", "sdp": "v=0"})).await;
        let (_, sink) = factory.last();
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        let second = *phase.borrow_and_update();
        assert_eq!(second.state, NegotiationState::Connected);
        assert_ne!(second.session, first.session);
    }

    #[tokio::test]
    async fn transport_failure_closes_session() {
        let factory = Arc::new(FakeFactory::default());
        let (mut n, _out) = negotiator(Role::Initiator, factory.clone());
        n.on_peer_discovered("phone").await;
        let (t, sink) = factory.last();
        sink.emit(TransportEvent::StateChanged(TransportState::Failed));
        pump(&mut n).await;
        assert_eq!(n.state(), NegotiationState::Closed);
        assert!(t.calls.lock().unwrap().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn server_mode_posts_after_gathering() {
        let factory = Arc::new(FakeFactory::default());
        let (tx, mut out) = mpsc::channel(8);
        let mut n = Negotiator::new(Role::Initiator, factory.clone(), OfferRoute::Server(Arc::new(FakeServer)), tx);
        n.start_server_session().await;
        assert_eq!(n.state(), NegotiationState::AwaitingAnswer);
        assert_eq!(n.peer_id(), Some(SERVER_PEER));

        let (t, sink) = factory.last();
        sink.emit(TransportEvent::LocalCandidate(Some(IceCandidate::from_value(cand(1)).unwrap())));
        pump(&mut n).await;
        assert!(t.remote.lock().unwrap().is_none());

        sink.emit(TransportEvent::LocalCandidate(None));
        sink.emit(TransportEvent::StateChanged(TransportState::Connected));
        pump(&mut n).await;
        assert_eq!(t.remote.lock().unwrap().as_ref().unwrap().sdp, "v=0 server");
        assert_eq!(n.state(), NegotiationState::Connected);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_closes_on_cancel() {
        let factory = Arc::new(FakeFactory::default());
        let (n, mut out) = negotiator(Role::Initiator, factory.clone());
        let mut state = n.subscribe_state();
        let (in_tx, in_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(n.run(in_rx, cancel.clone()));

        in_tx.send(RelayMsg::PeerJoined { peer: "phone".into() }).await.unwrap();
        assert!(matches!(out.recv().await, Some(ClientMsg::Offer { .. })));
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow_and_update(), NegotiationState::Closed);
        let (t, _) = factory.last();
        assert!(t.calls.lock().unwrap().contains(&"close".to_string()));
    }
}
