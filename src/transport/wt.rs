//! `wtransport` binding of the signaling transport
//!
//! One task per incoming QUIC connection: it waits for the session request,
//! runs it through the [`ConnectionDispatcher`] and then pumps datagrams and
//! client-opened unidirectional streams into the session until either side
//! goes away.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wtransport::endpoint::endpoint_side::Server;
use wtransport::endpoint::{IncomingSession, SessionRequest};
use wtransport::{Connection, Endpoint, Identity, RecvStream, ServerConfig as WtServerConfig};

use super::dispatcher::{ConnectionDispatcher, SessionHandle, UpgradeAcceptor};
use super::handshake::{UpgradeRequest, UpgradeResponse};
use super::{SignalingChannel, TransportEvent};
use crate::config::ServerConfig;
use crate::error::{AppError, Result};

/// Read size for unidirectional streams
const STREAM_READ_CHUNK: usize = 4096;

/// How long shutdown waits for sessions to clean up
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outbound signaling over an established WebTransport session
pub struct WtChannel {
    connection: Connection,
}

impl WtChannel {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl SignalingChannel for WtChannel {
    async fn send_datagram(&self, payload: Bytes) -> Result<()> {
        self.connection
            .send_datagram(payload)
            .map_err(|e| AppError::Transport(format!("Failed to send datagram: {}", e)))
    }

    async fn send_stream(&self, payload: Bytes) -> Result<()> {
        let mut stream = self
            .connection
            .open_uni()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to open stream: {}", e)))?
            .await
            .map_err(|e| AppError::Transport(format!("Failed to open stream: {}", e)))?;

        stream
            .write_all(&payload)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to write stream: {}", e)))?;
        stream
            .finish()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to finish stream: {}", e)))
    }
}

/// Upgrade request as delivered by `wtransport`
struct WtAcceptor {
    request: SessionRequest,
}

#[async_trait]
impl UpgradeAcceptor for WtAcceptor {
    type Channel = WtChannel;

    fn request(&self) -> UpgradeRequest {
        let mut request = UpgradeRequest::from_headers(self.request.headers());
        if request.path.is_empty() {
            request.path = self.request.path().to_string();
        }
        request
    }

    async fn accept(self, response: &UpgradeResponse) -> Result<WtChannel> {
        trace!("Accepting session request: {:?}", response);
        let connection = self
            .request
            .accept()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to accept session: {}", e)))?;
        Ok(WtChannel { connection })
    }

    async fn reject(self, response: &UpgradeResponse) -> Result<()> {
        trace!("Rejecting session request: {:?}", response);
        self.request.not_found().await;
        Ok(())
    }
}

/// Resolve the configured bind address
pub fn bind_addr(config: &ServerConfig) -> Result<SocketAddr> {
    let ip: IpAddr = config
        .bind_address
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid bind address '{}': {}", config.bind_address, e)))?;
    Ok(SocketAddr::new(ip, config.bind_port))
}

/// URL clients connect to
pub fn session_url(addr: SocketAddr) -> String {
    format!("https://{}{}", addr, super::handshake::WEBTRANSPORT_PATH)
}

/// Create the QUIC endpoint from the server settings
pub async fn bind(config: &ServerConfig) -> Result<Endpoint<Server>> {
    let addr = bind_addr(config)?;
    let certificate = Identity::load_pemfiles(&config.certificate, &config.key)
        .await
        .map_err(|e| AppError::Config(format!("Failed to load certificate: {}", e)))?;

    let keep_alive = (config.keep_alive_secs > 0).then(|| Duration::from_secs(config.keep_alive_secs));
    let max_idle = (config.max_idle_secs > 0).then(|| Duration::from_secs(config.max_idle_secs));

    let server_config = WtServerConfig::builder()
        .with_bind_address(addr)
        .with_identity(&certificate)
        .keep_alive_interval(keep_alive)
        .max_idle_timeout(max_idle)
        .map_err(|e| AppError::Config(format!("Invalid idle timeout: {}", e)))?
        .build();

    let endpoint = Endpoint::server(server_config)?;
    info!("Listening on {}", session_url(addr));
    Ok(endpoint)
}

/// Accept connections until `shutdown` is cancelled
///
/// Dropping the endpoint on return releases the UDP socket. Sessions still
/// running are told their connection is gone and get a bounded grace period
/// to release their generators and peers.
pub async fn serve(
    endpoint: Endpoint<Server>,
    dispatcher: Arc<ConnectionDispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(incoming, dispatcher, shutdown).await {
                        debug!("Connection ended with error: {}", e);
                    }
                });
            }
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    warn!("Connection task failed: {}", e);
                }
            }
        }
    }

    drop(endpoint);
    info!(
        "Endpoint closed, waiting for {} connection(s)",
        connections.len()
    );

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Sessions did not finish within {:?}", SHUTDOWN_GRACE);
        connections.abort_all();
    }
    Ok(())
}

async fn handle_connection(
    incoming: IncomingSession,
    dispatcher: Arc<ConnectionDispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let request = incoming
        .await
        .map_err(|e| AppError::Transport(format!("Connection failed: {}", e)))?;
    debug!(
        "Session request for {} ({})",
        request.path(),
        request.authority()
    );

    let Some(session) = dispatcher.dispatch(WtAcceptor { request }).await? else {
        return Ok(());
    };

    pump(&session, shutdown).await;
    if let Some(stats) = session.shutdown().await {
        debug!("Connection finished: {:?}", stats);
    }
    Ok(())
}

/// Forward connection events into the session until one side ends
async fn pump(session: &SessionHandle<WtChannel>, shutdown: CancellationToken) {
    let connection = session.channel().connection();
    let done = session.done();
    let mut next_stream_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = done.cancelled() => {
                debug!(session_id = session.session_id(), "Session finished");
                break;
            }
            datagram = connection.receive_datagram() => match datagram {
                Ok(datagram) => {
                    let event = TransportEvent::Datagram(Bytes::copy_from_slice(&datagram[..]));
                    if !session.forward(event).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session_id = session.session_id(), error = %e, "Connection closed");
                    break;
                }
            },
            stream = connection.accept_uni() => match stream {
                Ok(stream) => {
                    let stream_id = next_stream_id;
                    next_stream_id += 1;
                    tokio::spawn(read_stream(stream_id, stream, session.sender()));
                }
                Err(e) => {
                    debug!(session_id = session.session_id(), error = %e, "Connection closed");
                    break;
                }
            },
        }
    }
}

/// Read one unidirectional stream into session events
async fn read_stream(stream_id: u64, mut stream: RecvStream, events: mpsc::Sender<TransportEvent>) {
    let mut buf = vec![0u8; STREAM_READ_CHUNK];

    loop {
        let event = match stream.read(&mut buf).await {
            Ok(Some(n)) => TransportEvent::StreamData {
                stream_id,
                data: Bytes::copy_from_slice(&buf[..n]),
                fin: false,
            },
            Ok(None) => TransportEvent::StreamData {
                stream_id,
                data: Bytes::new(),
                fin: true,
            },
            Err(e) => {
                debug!(stream_id, error = %e, "Stream aborted");
                TransportEvent::StreamReset { stream_id }
            }
        };

        let last = !matches!(event, TransportEvent::StreamData { fin: false, .. });
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}
