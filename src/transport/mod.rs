//! WebTransport signaling transport
//!
//! [`handshake`] decides whether an upgrade request becomes a session,
//! [`dispatcher`] owns the session tasks and routes connection events to
//! them, and [`wt`] binds both to a `wtransport` endpoint.

pub mod dispatcher;
pub mod handshake;
pub mod wt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use dispatcher::{ConnectionDispatcher, SessionHandle, UpgradeAcceptor};
pub use handshake::{UpgradeRequest, UpgradeResponse};

/// Events delivered to a session after its upgrade was accepted
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Unreliable datagram payload
    Datagram(Bytes),
    /// Chunk read from a client-opened unidirectional stream
    StreamData {
        stream_id: u64,
        data: Bytes,
        /// Set on the final chunk of the stream
        fin: bool,
    },
    /// The client reset a unidirectional stream
    StreamReset { stream_id: u64 },
    /// The connection is gone
    Closed,
}

/// Outbound half of a session's transport
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one datagram
    async fn send_datagram(&self, payload: Bytes) -> Result<()>;

    /// Open a unidirectional stream, write `payload` and finish it
    async fn send_stream(&self, payload: Bytes) -> Result<()>;
}
