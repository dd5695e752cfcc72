//! Signaling state machine for one WebTransport session
//!
//! ```text
//! Handshaking --offer--> Negotiating --answer sent--> Active
//!      |                      |                         |
//!      |               negotiation error        peer failed/closed
//!      |                      v                         v
//!      +--transport closed--> Closing -------------> Closed
//! ```
//!
//! Transport events, media-engine events and a generator health check are
//! consumed by a single task ([`SessionHandler::run`]). Offers are handled
//! inline, so negotiation steps never interleave with each other. Remote
//! candidate submission and local candidate relaying run as detached tasks;
//! their ordering relative to the dispatch loop is not guaranteed.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::buffers::{Push, StreamBuffers};
use super::state::SessionState;
use super::SessionConfig;
use crate::debug_throttled;
use crate::error::Result;
use crate::transport::{SignalingChannel, TransportEvent};
use crate::utils::LogThrottler;
use crate::video::{measurement_error, BallGenerator};
use crate::webrtc::{
    prefer_codec, Decoded, IceCandidate, MediaPeer, PeerEvent, PeerFactory, SignalingMessage,
};

/// How often the run loop checks that the generator is still ticking
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub datagrams_received: u64,
    pub streams_completed: u64,
    pub malformed_dropped: u64,
    pub candidates_submitted: u64,
    pub candidates_relayed: u64,
    pub measurements_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_received: AtomicU64,
    streams_completed: AtomicU64,
    malformed_dropped: AtomicU64,
    candidates_submitted: AtomicU64,
    candidates_relayed: AtomicU64,
    measurements_sent: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            candidates_submitted: self.candidates_submitted.load(Ordering::Relaxed),
            candidates_relayed: self.candidates_relayed.load(Ordering::Relaxed),
            measurements_sent: self.measurements_sent.load(Ordering::Relaxed),
        }
    }
}

/// Coordinator for one client session
pub struct SessionHandler {
    session_id: String,
    config: SessionConfig,
    channel: Arc<dyn SignalingChannel>,
    peers: Arc<dyn PeerFactory>,
    state: SessionState,
    buffers: StreamBuffers,
    /// Created together with `peer` on the first accepted offer
    generator: Option<Arc<BallGenerator>>,
    peer: Option<Arc<dyn MediaPeer>>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    counters: Arc<Counters>,
    throttler: LogThrottler,
}

impl SessionHandler {
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            config,
            channel,
            peers,
            state: SessionState::Handshaking,
            buffers: StreamBuffers::new(),
            generator: None,
            peer: None,
            peer_tx,
            peer_rx: Some(peer_rx),
            counters: Arc::new(Counters::default()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session's generator, once an offer has been accepted
    pub fn generator(&self) -> Option<&Arc<BallGenerator>> {
        self.generator.as_ref()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Streams with a partially received message
    pub fn buffered_streams(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Drive the session until it is closed
    ///
    /// Returns when cleanup has completed: after the transport closes (or the
    /// event sender is dropped), the peer reports `failed`/`closed`,
    /// negotiation fails, or the generator stops on its own.
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) -> SessionStats {
        let Some(mut peer_events) = self.peer_rx.take() else {
            return self.stats();
        };
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(session_id = %self.session_id, "Session started");

        while self.state != SessionState::Closed {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.cleanup().await,
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                _ = health.tick() => self.check_generator().await,
            }
        }

        self.stats()
    }

    /// Dispatch one transport event
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Datagram(payload) => self.handle_datagram(payload).await,
            TransportEvent::StreamData {
                stream_id,
                data,
                fin,
            } => self.handle_stream_data(stream_id, &data, fin).await,
            TransportEvent::StreamReset { stream_id } => {
                if self.buffers.reset(stream_id) {
                    debug!(session_id = %self.session_id, stream_id, "Stream reset, buffer dropped");
                }
            }
            TransportEvent::Closed => {
                debug!(session_id = %self.session_id, "Transport closed");
                self.cleanup().await;
            }
        }
    }

    /// Dispatch one media-engine event
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.state.is_open() {
                    self.relay_candidate(candidate);
                }
            }
            PeerEvent::StateChanged(state) => {
                debug!(session_id = %self.session_id, %state, "Peer state changed");
                if state.is_terminal() && self.state.is_open() {
                    info!(session_id = %self.session_id, %state, "Peer connection ended, cleaning up");
                    self.cleanup().await;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, payload: Bytes) {
        Counters::bump(&self.counters.datagrams_received);

        match SignalingMessage::decode(&payload) {
            Decoded::Message(SignalingMessage::IceCandidate { candidate }) => {
                self.submit_candidate(candidate)
            }
            Decoded::Message(SignalingMessage::Coords { x, y }) => self.measure(x, y).await,
            Decoded::Message(other) => {
                debug!(session_id = %self.session_id, kind = other.kind(), "Ignoring datagram");
            }
            Decoded::Unrecognized(kind) => {
                debug!(session_id = %self.session_id, %kind, "Ignoring unrecognized datagram");
            }
            Decoded::Malformed(e) => {
                Counters::bump(&self.counters.malformed_dropped);
                debug_throttled!(
                    self.throttler,
                    "malformed-datagram",
                    session_id = %self.session_id,
                    error = %e,
                    "Dropped malformed datagram"
                );
            }
        }
    }

    async fn handle_stream_data(&mut self, stream_id: u64, data: &[u8], fin: bool) {
        match self.buffers.push(stream_id, data, fin) {
            Push::Pending => {}
            Push::Discarded => {
                debug!(session_id = %self.session_id, stream_id, "Discarding stream data");
            }
            Push::Complete(payload) => {
                Counters::bump(&self.counters.streams_completed);
                self.handle_stream_message(stream_id, payload).await;
            }
        }
    }

    async fn handle_stream_message(&mut self, stream_id: u64, payload: Bytes) {
        match SignalingMessage::decode(&payload) {
            Decoded::Message(SignalingMessage::Offer { sdp }) => self.handle_offer(sdp).await,
            Decoded::Message(other) => {
                debug!(
                    session_id = %self.session_id,
                    stream_id,
                    kind = other.kind(),
                    "Ignoring stream message"
                );
            }
            Decoded::Unrecognized(kind) => {
                debug!(
                    session_id = %self.session_id,
                    stream_id,
                    %kind,
                    "Ignoring unrecognized stream message"
                );
            }
            Decoded::Malformed(e) => {
                Counters::bump(&self.counters.malformed_dropped);
                debug_throttled!(
                    self.throttler,
                    "malformed-stream",
                    session_id = %self.session_id,
                    stream_id,
                    error = %e,
                    "Dropped malformed stream message"
                );
            }
        }
    }

    /// Accept an offer: only the first one, while handshaking
    pub async fn handle_offer(&mut self, sdp: String) {
        if self.state != SessionState::Handshaking {
            debug!(
                session_id = %self.session_id,
                state = %self.state,
                "Ignoring offer"
            );
            return;
        }

        self.state = SessionState::Negotiating;
        info!(session_id = %self.session_id, "Received offer, negotiating");

        match self.negotiate(sdp).await {
            Ok(()) => {
                self.state = SessionState::Active;
                info!(session_id = %self.session_id, "Answer sent, session active");
            }
            Err(e) => {
                warn!(session_id = %self.session_id, kind = e.kind(), error = %e, "Negotiation failed");
                self.cleanup().await;
            }
        }
    }

    async fn negotiate(&mut self, sdp: String) -> Result<()> {
        let name: String = self.session_id.chars().take(8).collect();
        let generator = Arc::new(BallGenerator::new(name, &self.config.video));
        self.generator = Some(generator.clone());
        generator.start()?;

        let peer = self
            .peers
            .create(&self.session_id, self.peer_tx.clone())
            .await?;
        self.peer = Some(peer.clone());

        peer.add_track(generator).await?;
        peer.set_remote_offer(sdp).await?;
        let mut answer = peer.create_answer().await?;
        if let Some(codec) = self.config.webrtc.preferred_codec {
            answer = prefer_codec(&answer, codec.rtpmap_name());
        }

        let payload = SignalingMessage::Answer { sdp: answer }.encode()?;
        self.channel.send_stream(Bytes::from(payload)).await
    }

    fn submit_candidate(&self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else {
            debug!(session_id = %self.session_id, "No peer yet, dropping candidate");
            return;
        };

        let session_id = self.session_id.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            match peer.add_ice_candidate(candidate).await {
                Ok(()) => Counters::bump(&counters.candidates_submitted),
                Err(e) => debug!(%session_id, error = %e, "Failed to add candidate"),
            }
        });
    }

    fn relay_candidate(&self, candidate: IceCandidate) {
        let payload = match (SignalingMessage::IceCandidate { candidate }).encode() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to encode candidate");
                return;
            }
        };

        let channel = self.channel.clone();
        let session_id = self.session_id.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            match channel.send_datagram(payload).await {
                Ok(()) => Counters::bump(&counters.candidates_relayed),
                Err(e) => debug!(%session_id, error = %e, "Failed to relay candidate"),
            }
        });
    }

    async fn measure(&mut self, x: f64, y: f64) {
        let Some(generator) = self.generator.as_ref().filter(|g| g.is_running()) else {
            return;
        };

        let e = measurement_error(generator.snapshot_position(), (x, y));
        let payload = match (SignalingMessage::Error { e }).encode() {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "Failed to encode measurement");
                return;
            }
        };

        match self.channel.send_datagram(payload).await {
            Ok(()) => Counters::bump(&self.counters.measurements_sent),
            Err(err) => debug!(session_id = %self.session_id, error = %err, "Failed to send measurement"),
        }
    }

    async fn check_generator(&mut self) {
        let Some(generator) = &self.generator else {
            return;
        };
        if generator.is_running() {
            return;
        }

        let error = generator
            .last_error()
            .unwrap_or_else(|| "none recorded".to_string());
        warn!(session_id = %self.session_id, %error, "Generator stopped");
        self.cleanup().await;
    }

    /// Release the generator and peer; safe to call more than once
    pub async fn cleanup(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(generator) = self.generator.take() {
            generator.stop();
            let timeout = self.config.webrtc.stop_timeout();
            let joined = tokio::task::spawn_blocking(move || generator.join_timeout(timeout))
                .await
                .unwrap_or(false);
            if !joined {
                warn!(session_id = %self.session_id, "Generator did not exit cleanly");
            }
        }

        if let Some(peer) = self.peer.take() {
            match tokio::time::timeout(self.config.webrtc.close_timeout(), peer.close()).await {
                Ok(Ok(())) => debug!(session_id = %self.session_id, "Peer closed"),
                Ok(Err(e)) => warn!(session_id = %self.session_id, error = %e, "Peer close failed"),
                Err(_) => warn!(session_id = %self.session_id, "Peer close timed out"),
            }
        }

        self.buffers.clear();
        self.state = SessionState::Closed;
        info!(session_id = %self.session_id, stats = ?self.stats(), "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConfig;
    use crate::error::AppError;
    use crate::webrtc::ConnectionState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const ANSWER_SDP: &str = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96 97\r\na=rtpmap:96 VP8/90000\r\na=rtpmap:97 H264/90000\r\n";

    #[derive(Default)]
    struct FakeChannel {
        datagrams: Mutex<Vec<Bytes>>,
        streams: Mutex<Vec<Bytes>>,
        fail_streams: bool,
    }

    #[async_trait]
    impl SignalingChannel for FakeChannel {
        async fn send_datagram(&self, payload: Bytes) -> Result<()> {
            self.datagrams.lock().push(payload);
            Ok(())
        }

        async fn send_stream(&self, payload: Bytes) -> Result<()> {
            if self.fail_streams {
                return Err(AppError::Transport("stream refused".to_string()));
            }
            self.streams.lock().push(payload);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePeer {
        fail_remote: bool,
        remote_offer: Mutex<Option<String>>,
        candidates: Mutex<Vec<IceCandidate>>,
        source: Mutex<Option<Arc<BallGenerator>>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl MediaPeer for FakePeer {
        async fn add_track(&self, source: Arc<BallGenerator>) -> Result<()> {
            *self.source.lock() = Some(source);
            Ok(())
        }

        async fn set_remote_offer(&self, sdp: String) -> Result<()> {
            if self.fail_remote {
                return Err(AppError::WebRtcError("bad offer".to_string()));
            }
            *self.remote_offer.lock() = Some(sdp);
            Ok(())
        }

        async fn create_answer(&self) -> Result<String> {
            Ok(ANSWER_SDP.to_string())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        peer: Arc<FakePeer>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create(
            &self,
            _session_id: &str,
            _events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn MediaPeer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.peer.clone())
        }
    }

    /// 20x20 frame with a stationary ball at (10, 10)
    fn still_ball() -> VideoConfig {
        VideoConfig {
            width: 20,
            height: 20,
            fps: 50,
            radius: 2,
            velocity: (0, 0),
            save_frames_dir: None,
        }
    }

    struct Harness {
        handler: SessionHandler,
        channel: Arc<FakeChannel>,
        factory: Arc<FakeFactory>,
        peer: Arc<FakePeer>,
    }

    fn harness_with(video: VideoConfig, peer: FakePeer, channel: FakeChannel) -> Harness {
        let peer = Arc::new(peer);
        let channel = Arc::new(channel);
        let factory = Arc::new(FakeFactory {
            peer: peer.clone(),
            created: AtomicUsize::new(0),
        });
        let config = SessionConfig {
            video,
            ..Default::default()
        };
        let handler = SessionHandler::new("test-session", config, channel.clone(), factory.clone());
        Harness {
            handler,
            channel,
            factory,
            peer,
        }
    }

    fn harness() -> Harness {
        harness_with(still_ball(), FakePeer::default(), FakeChannel::default())
    }

    fn offer_bytes(sdp: &str) -> Bytes {
        Bytes::from(
            SignalingMessage::Offer {
                sdp: sdp.to_string(),
            }
            .encode()
            .unwrap(),
        )
    }

    fn offer_event(stream_id: u64, sdp: &str) -> TransportEvent {
        TransportEvent::StreamData {
            stream_id,
            data: offer_bytes(sdp),
            fin: true,
        }
    }

    fn datagram(json: &str) -> TransportEvent {
        TransportEvent::Datagram(Bytes::copy_from_slice(json.as_bytes()))
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        let started = Instant::now();
        while !cond() && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cond(), "condition not reached in time");
    }

    #[tokio::test]
    async fn test_offer_negotiates_and_sends_answer() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0 offer")).await;

        assert_eq!(h.handler.state(), SessionState::Active);
        assert!(h.handler.has_peer());
        assert!(h.handler.generator().unwrap().is_running());
        assert_eq!(h.peer.remote_offer.lock().as_deref(), Some("v=0 offer"));

        let streams = h.channel.streams.lock().clone();
        assert_eq!(streams.len(), 1);
        match SignalingMessage::decode(&streams[0]) {
            Decoded::Message(SignalingMessage::Answer { sdp }) => {
                // H264 moved to the front of the video format list
                assert!(sdp.contains("m=video 9 UDP/TLS/RTP/SAVPF 97 96\r\n"));
                assert!(sdp.contains("a=rtpmap:96 VP8/90000\r\n"));
            }
            other => panic!("unexpected stream payload: {:?}", other),
        }

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_offer_reassembled_from_chunks() {
        let mut h = harness();
        let payload = offer_bytes("v=0 chunked");
        let (head, tail) = payload.split_at(7);

        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 6,
                data: Bytes::copy_from_slice(head),
                fin: false,
            })
            .await;
        assert_eq!(h.handler.state(), SessionState::Handshaking);
        assert_eq!(h.handler.buffered_streams(), 1);

        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 6,
                data: Bytes::copy_from_slice(tail),
                fin: true,
            })
            .await;
        assert_eq!(h.handler.state(), SessionState::Active);
        assert_eq!(h.handler.buffered_streams(), 0);

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_malformed_stream_leaves_state_unchanged() {
        let mut h = harness();
        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 2,
                data: Bytes::from_static(b"{not json"),
                fin: true,
            })
            .await;
        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 6,
                data: Bytes::from_static(b"{\"type\":\"answer\",\"sdp\":\"x\"}"),
                fin: true,
            })
            .await;

        assert_eq!(h.handler.state(), SessionState::Handshaking);
        assert!(h.handler.generator().is_none());
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(h.handler.stats().malformed_dropped, 1);
        assert_eq!(h.handler.buffered_streams(), 0);
    }

    #[tokio::test]
    async fn test_reset_stream_never_yields_offer() {
        let mut h = harness();
        let payload = offer_bytes("v=0 reset");
        let (head, tail) = payload.split_at(10);

        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 10,
                data: Bytes::copy_from_slice(head),
                fin: false,
            })
            .await;
        h.handler
            .handle_event(TransportEvent::StreamReset { stream_id: 10 })
            .await;
        assert_eq!(h.handler.buffered_streams(), 0);

        h.handler
            .handle_event(TransportEvent::StreamData {
                stream_id: 10,
                data: Bytes::copy_from_slice(tail),
                fin: true,
            })
            .await;

        assert_eq!(h.handler.state(), SessionState::Handshaking);
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_offer_is_ignored() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "first")).await;
        h.handler.handle_event(offer_event(6, "second")).await;

        assert_eq!(h.handler.state(), SessionState::Active);
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.peer.remote_offer.lock().as_deref(), Some("first"));
        assert_eq!(h.channel.streams.lock().len(), 1);

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_coords_measurement() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0")).await;
        assert_eq!(
            h.handler.generator().unwrap().snapshot_position(),
            (10, 10)
        );

        h.handler
            .handle_event(datagram(r#"{"type":"coords","x":7,"y":6}"#))
            .await;

        let datagrams = h.channel.datagrams.lock().clone();
        assert_eq!(datagrams.len(), 1);
        match SignalingMessage::decode(&datagrams[0]) {
            Decoded::Message(SignalingMessage::Error { e }) => assert!((e - 5.0).abs() < 1e-9),
            other => panic!("unexpected datagram: {:?}", other),
        }
        assert_eq!(h.handler.stats().measurements_sent, 1);

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_coords_without_generator_are_ignored() {
        let mut h = harness();
        h.handler
            .handle_event(datagram(r#"{"type":"coords","x":1,"y":2}"#))
            .await;

        assert!(h.channel.datagrams.lock().is_empty());
        assert_eq!(h.handler.stats().datagrams_received, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_datagrams_dropped() {
        let mut h = harness();
        h.handler.handle_event(datagram("not json")).await;
        h.handler.handle_event(datagram(r#"{"type":"ping"}"#)).await;
        h.handler
            .handle_event(datagram(r#"{"type":"coords","x":"a"}"#))
            .await;

        assert_eq!(h.handler.state(), SessionState::Handshaking);
        assert_eq!(h.handler.stats().datagrams_received, 3);
        assert_eq!(h.handler.stats().malformed_dropped, 2);
        assert!(h.channel.datagrams.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_candidate_submitted_to_peer() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0")).await;
        h.handler
            .handle_event(datagram(
                r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
            ))
            .await;

        let peer = h.peer.clone();
        wait_until(|| !peer.candidates.lock().is_empty()).await;
        let candidate = h.peer.candidates.lock()[0].clone();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_dropped() {
        let mut h = harness();
        h.handler
            .handle_event(datagram(
                r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1"}}"#,
            ))
            .await;

        assert_eq!(h.handler.state(), SessionState::Handshaking);
        assert!(!h.handler.has_peer());
        assert!(h.peer.candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_relayed_as_datagrams() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0")).await;

        for port in [5000, 5002] {
            let candidate = IceCandidate::new(format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                port
            ))
            .with_mid("0", 0);
            h.handler
                .handle_peer_event(PeerEvent::LocalCandidate(candidate))
                .await;
        }

        let channel = h.channel.clone();
        wait_until(|| channel.datagrams.lock().len() == 2).await;
        for payload in h.channel.datagrams.lock().iter() {
            assert!(matches!(
                SignalingMessage::decode(payload),
                Decoded::Message(SignalingMessage::IceCandidate { .. })
            ));
        }

        h.handler.cleanup().await;
    }

    #[tokio::test]
    async fn test_negotiation_failure_cleans_up() {
        let peer = FakePeer {
            fail_remote: true,
            ..Default::default()
        };
        let mut h = harness_with(still_ball(), peer, FakeChannel::default());
        h.handler.handle_event(offer_event(2, "v=0")).await;

        assert_eq!(h.handler.state(), SessionState::Closed);
        assert!(h.handler.generator().is_none());
        assert!(!h.handler.has_peer());
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);

        let source = h.peer.source.lock().clone().unwrap();
        assert!(!source.is_running());
        assert!(h.channel.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn test_answer_send_failure_cleans_up() {
        let channel = FakeChannel {
            fail_streams: true,
            ..Default::default()
        };
        let mut h = harness_with(still_ball(), FakePeer::default(), channel);
        h.handler.handle_event(offer_event(2, "v=0")).await;

        assert_eq!(h.handler.state(), SessionState::Closed);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0")).await;
        let source = h.peer.source.lock().clone().unwrap();

        h.handler.cleanup().await;
        h.handler.cleanup().await;

        assert_eq!(h.handler.state(), SessionState::Closed);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
        assert!(!source.is_running());
        assert!(h.handler.generator().is_none());

        // A late offer does not resurrect the session
        h.handler.handle_event(offer_event(6, "late")).await;
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_failure_triggers_cleanup() {
        let mut h = harness();
        h.handler.handle_event(offer_event(2, "v=0")).await;

        h.handler
            .handle_peer_event(PeerEvent::StateChanged(ConnectionState::Connected))
            .await;
        assert_eq!(h.handler.state(), SessionState::Active);

        h.handler
            .handle_peer_event(PeerEvent::StateChanged(ConnectionState::Failed))
            .await;
        assert_eq!(h.handler.state(), SessionState::Closed);
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);

        h.handler
            .handle_peer_event(PeerEvent::StateChanged(ConnectionState::Closed))
            .await;
        assert_eq!(h.peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_ends_when_transport_closes() {
        let h = harness();
        let peer = h.peer.clone();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(h.handler.run(rx));

        tx.send(offer_event(2, "v=0")).await.unwrap();
        tx.send(datagram(r#"{"type":"coords","x":10,"y":10}"#))
            .await
            .unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.streams_completed, 1);
        assert_eq!(stats.datagrams_received, 1);
        assert_eq!(stats.measurements_sent, 1);
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_closes_session_when_generator_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let video = VideoConfig {
            save_frames_dir: Some(file.path().join("frames")),
            ..still_ball()
        };
        let h = harness_with(video, FakePeer::default(), FakeChannel::default());
        let peer = h.peer.clone();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(h.handler.run(rx));

        tx.send(offer_event(2, "v=0")).await.unwrap();

        // The sender stays open; only the health check can end the session
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
        drop(tx);
    }
}
