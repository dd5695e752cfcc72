//! Connection dispatcher
//!
//! Turns accepted upgrade requests into running sessions. Each session gets
//! its own [`SessionHandler`] task fed by a bounded event queue; the
//! transport binding forwards connection events through the returned
//! [`SessionHandle`]. A rejected request never gets a handler, so nothing
//! it sends afterwards reaches a session.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handshake::{UpgradeRequest, UpgradeResponse};
use super::{SignalingChannel, TransportEvent};
use crate::error::Result;
use crate::session::{SessionConfig, SessionHandler, SessionStats};
use crate::webrtc::PeerFactory;

/// Pending events per session before the reader side waits
const EVENT_QUEUE_SIZE: usize = 256;

/// A pending upgrade request from the transport engine
#[async_trait]
pub trait UpgradeAcceptor: Send + Sized {
    /// Outbound channel of an accepted session
    type Channel: SignalingChannel + 'static;

    fn request(&self) -> UpgradeRequest;

    /// Send the success response and return the session's channel
    async fn accept(self, response: &UpgradeResponse) -> Result<Self::Channel>;

    /// Send the rejection response and end the request stream
    async fn reject(self, response: &UpgradeResponse) -> Result<()>;
}

/// Routes a running session's transport events to its handler
pub struct SessionHandle<C> {
    session_id: String,
    channel: Arc<C>,
    events: mpsc::Sender<TransportEvent>,
    done: CancellationToken,
    task: JoinHandle<SessionStats>,
}

impl<C> SessionHandle<C> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Sender for stream reader tasks
    pub fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.events.clone()
    }

    /// Cancelled once the handler has finished
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Forward one event; `false` once the session has ended
    pub async fn forward(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Tell the session its connection is gone and wait for cleanup
    pub async fn shutdown(self) -> Option<SessionStats> {
        let _ = self.events.send(TransportEvent::Closed).await;
        drop(self.events);
        self.task.await.ok()
    }
}

/// Creates sessions for accepted upgrades
pub struct ConnectionDispatcher {
    config: SessionConfig,
    peers: Arc<dyn PeerFactory>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ConnectionDispatcher {
    pub fn new(config: SessionConfig, peers: Arc<dyn PeerFactory>) -> Self {
        Self {
            config,
            peers,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Validate an upgrade request and start a session for it
    ///
    /// Returns `None` when the request was rejected with 404.
    pub async fn dispatch<A: UpgradeAcceptor>(
        &self,
        acceptor: A,
    ) -> Result<Option<SessionHandle<A::Channel>>> {
        let request = acceptor.request();
        let response = request.evaluate();

        if !response.is_success() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Rejecting upgrade {} {:?} {}",
                request.method, request.protocol, request.path
            );
            acceptor.reject(&response).await?;
            return Ok(None);
        }

        let channel = Arc::new(acceptor.accept(&response).await?);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.spawn_session(channel)))
    }

    /// Start a handler task for an accepted session
    pub fn spawn_session<C: SignalingChannel + 'static>(&self, channel: Arc<C>) -> SessionHandle<C> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let handler = SessionHandler::new(
            session_id.clone(),
            self.config.clone(),
            channel.clone(),
            self.peers.clone(),
        );

        let (events, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let done = CancellationToken::new();
        let finished = done.clone();
        let task = tokio::spawn(async move {
            let stats = handler.run(rx).await;
            finished.cancel();
            stats
        });

        info!(%session_id, "Session accepted");
        SessionHandle {
            session_id,
            channel,
            events,
            done,
            task,
        }
    }

    /// Upgrades accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Upgrades rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
