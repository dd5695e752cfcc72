//! WebRTC peer connection management

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::signaling::{ConnectionState, IceCandidate};
use super::track::{h264_capability, BallVideoTrack};
use crate::error::{AppError, Result};
use crate::video::{BallGenerator, H264Encoder};

/// Signals raised by the media engine, delivered to the owning session
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// Peer connection state changed
    StateChanged(ConnectionState),
}

/// Media peer as seen by a signaling session
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Attach the outgoing video track fed by `source`
    async fn add_track(&self, source: Arc<BallGenerator>) -> Result<()>;

    /// Apply the client's SDP offer as remote description
    async fn set_remote_offer(&self, sdp: String) -> Result<()>;

    /// Create the answer, set it as local description and return its SDP
    async fn create_answer(&self) -> Result<String>;

    /// Submit a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection and stop media
    async fn close(&self) -> Result<()>;
}

/// Creates one media peer per session
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>>;
}

/// Build a WebRTC API with default codecs and interceptors
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// webrtc-rs backed [`MediaPeer`]
pub struct RtcPeer {
    session_id: String,
    config: WebRtcConfig,
    fps: u32,
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RtcPeer {
    /// Create a peer connection gathering host candidates only
    pub async fn new(
        config: &WebRtcConfig,
        fps: u32,
        session_id: String,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: vec![],
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        let peer = Self {
            session_id,
            config: config.clone(),
            fps,
            pc,
            state_rx,
            cancel: CancellationToken::new(),
            writer: parking_lot::Mutex::new(None),
        };
        peer.setup_event_handlers(Arc::new(state_tx), events);

        Ok(peer)
    }

    /// Bridge engine callbacks into the session's event channel
    fn setup_event_handlers(
        &self,
        state: Arc<watch::Sender<ConnectionState>>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) {
        let session_id = self.session_id.clone();
        let state_events = events.clone();

        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let events = state_events.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!(%session_id, state = %new_state, "Peer connection state changed");
                    let _ = state.send(new_state);
                    let _ = events.send(PeerEvent::StateChanged(new_state));
                })
            }));

        let session_id = self.session_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let Some(c) = candidate else {
                        debug!(%session_id, "Finished gathering candidates");
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!(%session_id, candidate = %init.candidate, "Local ICE candidate");
                            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn add_track(&self, source: Arc<BallGenerator>) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            self.config.track_id.clone(),
            self.config.stream_id.clone(),
        ));

        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let encoder = H264Encoder::new(source.resolution())?;
        let writer = BallVideoTrack::new(source, self.fps).spawn_writer(
            Box::new(encoder),
            track,
            self.state_rx.clone(),
            self.cancel.clone(),
        );
        if let Some(previous) = self.writer.lock().replace(writer) {
            previous.abort();
        }

        info!(session_id = %self.session_id, "Video track added");
        Ok(())
    }

    async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to set local description: {}", e))
            })?;

        Ok(self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(answer.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Creates [`RtcPeer`]s sharing one WebRTC configuration
pub struct RtcPeerFactory {
    config: WebRtcConfig,
    fps: u32,
}

impl RtcPeerFactory {
    pub fn new(config: WebRtcConfig, fps: u32) -> Self {
        Self { config, fps }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>> {
        let peer = RtcPeer::new(&self.config, self.fps, session_id.to_string(), events).await?;
        Ok(Arc::new(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConfig;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    fn generator() -> Arc<BallGenerator> {
        let config = VideoConfig {
            width: 64,
            height: 48,
            fps: 10,
            radius: 4,
            velocity: (1, 1),
            save_frames_dir: None,
        };
        Arc::new(BallGenerator::new("peer-test", &config))
    }

    #[tokio::test]
    async fn test_new_peer_starts_in_new_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&WebRtcConfig::default(), 10, "s1".to_string(), tx)
            .await
            .unwrap();

        assert_eq!(peer.state(), ConnectionState::New);
        assert_eq!(peer.session_id(), "s1");
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = RtcPeerFactory::new(WebRtcConfig::default(), 10);
        let peer = factory.create("s2", tx).await.unwrap();

        assert!(peer.set_remote_offer("not sdp".to_string()).await.is_err());
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answers_video_offer() {
        let offerer = build_api()
            .unwrap()
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        offerer
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = offerer.create_offer(None).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = RtcPeerFactory::new(WebRtcConfig::default(), 10);
        let peer = factory.create("s3", tx).await.unwrap();

        peer.add_track(generator()).await.unwrap();
        peer.set_remote_offer(offer.sdp).await.unwrap();
        let answer = peer.create_answer().await.unwrap();

        assert!(answer.contains("m=video"));
        assert!(answer.contains("H264"));

        peer.close().await.unwrap();
        offerer.close().await.unwrap();
    }
}
