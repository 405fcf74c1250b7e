//! A single replica connection.
//!
//! Writes are serialized by the writer lock, so at most one frame is on its
//! way out at a time. Only the dispatcher's receive loop reads. Send and
//! receive timestamps feed the health heuristic used by the channel pool.

use crate::address::ServerAddress;
use crate::context::TransportContext;
use crate::error::{TransportError, TransportErrorCode};
use crate::options::{PortReuseMode, RECEIVE_HANG_GRACE_PERIOD, SEND_HANG_GRACE_PERIOD};
use crate::port_pool::{AddressFamily, UserPortPool};
use crate::stream::ClientStream;
use crate::tls;
use bytes::{Bytes, BytesMut};
use rand::seq::SliceRandom;
use rntbd_protocol::frame::BODY_LENGTH_SIZE;
use rntbd_protocol::{
    ContextResponse, ResponseFrame, ResponsePreamble, TokenStream, RESPONSE_PREAMBLE_SIZE,
};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A connection that received data this recently is healthy without further checks.
const RECENT_RECEIVE_WINDOW: Duration = Duration::from_secs(1);

/// Metadata and body buffers start at most this large and grow as bytes
/// arrive, so a declared length alone never reserves memory.
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    last_send_attempt: Instant,
    last_send: Instant,
    last_receive: Instant,
}

/// Send/receive state of a connection, attached to timeout errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub since_last_send_attempt: Duration,
    pub since_last_send: Duration,
    pub since_last_receive: Duration,
    pub broken: bool,
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "last send attempt {:?} ago, last send {:?} ago, last receive {:?} ago{}",
            self.since_last_send_attempt,
            self.since_last_send,
            self.since_last_receive,
            if self.broken { ", broken" } else { "" }
        )
    }
}

/// A local port held in the user port pool for the life of a connection.
struct PortLease {
    pool: Arc<UserPortPool>,
    family: AddressFamily,
    port: u16,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.remove_reference(self.family, self.port);
    }
}

/// Marks the connection broken when a frame write is abandoned partway,
/// e.g. because the caller's future was dropped.
struct WriteInProgress<'a> {
    connection: &'a Connection,
    finished: bool,
}

impl Drop for WriteInProgress<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.connection.mark_broken();
            tracing::warn!(
                connection = %self.connection.description,
                "frame write abandoned, connection marked broken"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthSettings {
    send_hang_detection: Duration,
    receive_hang_detection: Duration,
    idle_timeout: Option<Duration>,
}

/// One TCP (optionally TLS) connection to a replica.
///
/// The socket is split into halves behind async mutexes: writers queue on
/// the writer lock, the receive loop holds the reader lock.
pub struct Connection {
    target: String,
    description: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    is_tls: bool,
    writer: Mutex<WriteHalf<ClientStream>>,
    reader: Mutex<ReadHalf<ClientStream>>,
    /// Duplicate of the socket handle, for health probes and forced shutdown.
    probe: socket2::Socket,
    timestamps: parking_lot::Mutex<Timestamps>,
    health: HealthSettings,
    broken: AtomicBool,
    disposed: AtomicBool,
    port_lease: parking_lot::Mutex<Option<PortLease>>,
}

impl Connection {
    /// Resolves, connects and, when configured, completes the TLS handshake.
    pub async fn open(
        address: &ServerAddress,
        activity_id: Uuid,
        context: &TransportContext,
    ) -> Result<Self, TransportError> {
        let target = address.to_string();
        let options = context.options();

        let remote = resolve(address, &target, activity_id).await?;
        tracing::debug!("Connecting to {} ({})...", target, remote);

        let (tcp, port_lease) = connect(remote, context, &target, activity_id).await?;
        let connect_error = |e: io::Error| {
            TransportError::new(
                TransportErrorCode::ConnectFailed,
                target.as_str(),
                "failed to configure socket",
            )
            .with_activity_id(activity_id)
            .with_io(e)
        };
        tcp.set_nodelay(true).map_err(connect_error)?;
        let local_addr = tcp.local_addr().map_err(connect_error)?;
        let probe = socket2::SockRef::from(&tcp)
            .try_clone()
            .map_err(connect_error)?;
        let description = format!("{} -> {}", local_addr, remote);

        let stream = match context.tls_connector() {
            Some(connector) => {
                let tls_error = |message: String| {
                    TransportError::new(
                        TransportErrorCode::SslNegotiationFailed,
                        target.as_str(),
                        message,
                    )
                    .with_activity_id(activity_id)
                    .with_connection(description.as_str())
                };
                let server_name = tls::server_name(&options.tls, address.host())
                    .map_err(|e| tls_error(e.to_string()))?;
                tracing::debug!("Performing TLS handshake with {}...", target);
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| tls_error("TLS handshake failed".to_string()).with_io(e))?;
                ClientStream::Tls { stream: tls_stream }
            }
            None => ClientStream::Plain { stream: tcp },
        };
        let is_tls = stream.is_tls();
        if let Some(version) = stream.tls_version() {
            tracing::debug!(connection = %description, version = %version, "TLS handshake complete");
        }

        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();

        tracing::debug!(connection = %description, tls = is_tls, "connection open");

        Ok(Self {
            target,
            description,
            local_addr,
            peer_addr: remote,
            is_tls,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            probe,
            timestamps: parking_lot::Mutex::new(Timestamps {
                last_send_attempt: now,
                last_send: now,
                last_receive: now,
            }),
            health: HealthSettings {
                send_hang_detection: options.send_hang_detection(),
                receive_hang_detection: options.receive_hang_detection(),
                idle_timeout: options.idle_timeout(),
            },
            broken: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            port_lease: parking_lot::Mutex::new(port_lease),
        })
    }

    /// The replica address this connection was opened for.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// `local -> remote`, attached to errors and logs.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Local socket address, including the port taken from the port pool.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The resolved address actually connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns true if the TLS handshake was performed.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    fn error(&self, code: TransportErrorCode, message: impl Into<String>) -> TransportError {
        TransportError::new(code, self.target.as_str(), message)
            .with_connection(self.description.as_str())
    }

    /// Writes one complete frame and flushes it.
    ///
    /// A frame that is not fully written, whether the write fails or the
    /// returned future is dropped, marks the connection broken. Later
    /// writes are refused so no frame ever follows a partial one.
    pub async fn write_request(&self, frame: &[u8], activity_id: Uuid) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(self
                .error(TransportErrorCode::SendFailed, "connection is closed")
                .with_activity_id(activity_id));
        }

        let mut writer = self.writer.lock().await;
        if self.is_broken() {
            return Err(self
                .error(TransportErrorCode::SendFailed, "connection is broken")
                .with_activity_id(activity_id));
        }
        self.timestamps.lock().last_send_attempt = Instant::now();

        let mut in_progress = WriteInProgress {
            connection: self,
            finished: false,
        };
        let result = match writer.write_all(frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        in_progress.finished = true;

        match result {
            Ok(()) => {
                self.timestamps.lock().last_send = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.mark_broken();
                // Part of the frame may already be on the wire.
                Err(self
                    .error(TransportErrorCode::SendFailed, "failed to write request")
                    .with_activity_id(activity_id)
                    .with_payload_sent(true)
                    .with_io(e))
            }
        }
    }

    /// Reads one response frame. A body follows when the payload-present
    /// token is set.
    pub async fn read_response(&self) -> Result<ResponseFrame, TransportError> {
        let mut reader = self.reader.lock().await;
        let (preamble, headers) = self.read_response_metadata(&mut reader).await?;
        let body = if rntbd_protocol::frame::response_payload_present(&headers) {
            Some(self.read_response_body(&mut reader).await?)
        } else {
            None
        };
        Ok(ResponseFrame {
            preamble,
            headers,
            body,
        })
    }

    /// Reads the context negotiation response. Its body, the JSON error,
    /// is present exactly when the status is outside 2xx/3xx.
    pub async fn read_context_response(&self) -> Result<ContextResponse, TransportError> {
        let mut reader = self.reader.lock().await;
        let (preamble, headers) = self.read_response_metadata(&mut reader).await?;
        let accepted = rntbd_protocol::StatusCode(preamble.status).is_success_or_redirect();
        let body = if accepted {
            None
        } else {
            Some(self.read_response_body(&mut reader).await?)
        };
        Ok(ContextResponse::from_frame(ResponseFrame {
            preamble,
            headers,
            body,
        }))
    }

    async fn read_response_metadata(
        &self,
        reader: &mut ReadHalf<ClientStream>,
    ) -> Result<(ResponsePreamble, TokenStream), TransportError> {
        let mut fixed = [0u8; RESPONSE_PREAMBLE_SIZE];
        self.read_fully(reader, &mut fixed).await?;

        let malformed = |e: rntbd_protocol::ProtocolError| {
            self.error(
                TransportErrorCode::InvalidResponse,
                format!("malformed response: {}", e),
            )
        };
        let preamble = ResponsePreamble::decode(&fixed).map_err(malformed)?;
        let metadata_len = preamble.metadata_len().map_err(malformed)?;

        let metadata = self.read_exact_len(reader, metadata_len).await?;
        let headers = TokenStream::decode(metadata).map_err(malformed)?;
        Ok((preamble, headers))
    }

    async fn read_response_body(
        &self,
        reader: &mut ReadHalf<ClientStream>,
    ) -> Result<Bytes, TransportError> {
        let mut length = [0u8; BODY_LENGTH_SIZE];
        self.read_fully(reader, &mut length).await?;
        let length = u32::from_le_bytes(length) as usize;
        if length > rntbd_protocol::BODY_WARN_THRESHOLD {
            tracing::warn!(connection = %self.description, length, "receiving oversized response body");
        }

        self.read_exact_len(reader, length).await
    }

    /// Reads exactly `len` bytes into a buffer that grows with the data
    /// actually received.
    async fn read_exact_len(
        &self,
        reader: &mut ReadHalf<ClientStream>,
        len: usize,
    ) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::with_capacity(len.min(READ_CHUNK_SIZE));
        while buf.len() < len {
            let remaining = len - buf.len();
            if buf.len() == buf.capacity() {
                buf.reserve(remaining.min(READ_CHUNK_SIZE));
            }
            let n = (&mut *reader)
                .take(remaining as u64)
                .read_buf(&mut buf)
                .await
                .map_err(|e| {
                    self.error(TransportErrorCode::ReceiveFailed, "failed to read response")
                        .with_io(e)
                })?;
            if n == 0 {
                return Err(self.stream_closed(buf.len(), len));
            }
            self.timestamps.lock().last_receive = Instant::now();
        }
        Ok(buf.freeze())
    }

    fn stream_closed(&self, filled: usize, total: usize) -> TransportError {
        self.error(
            TransportErrorCode::ReceiveStreamClosed,
            format!("stream closed with {} of {} bytes read", filled, total),
        )
    }

    /// Fills `buf`, looping over short reads. Any progress counts as a receive.
    async fn read_fully(
        &self,
        reader: &mut ReadHalf<ClientStream>,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await.map_err(|e| {
                self.error(TransportErrorCode::ReceiveFailed, "failed to read response")
                    .with_io(e)
            })?;
            if n == 0 {
                return Err(self.stream_closed(filled, buf.len()));
            }
            filled += n;
            self.timestamps.lock().last_receive = Instant::now();
        }
        Ok(())
    }

    /// Cheap liveness heuristic, evaluated when the pool selects a channel.
    pub fn healthy(&self) -> bool {
        if self.is_broken() {
            return false;
        }

        let now = Instant::now();
        let ts = *self.timestamps.lock();

        if now.saturating_duration_since(ts.last_receive) < RECENT_RECEIVE_WINDOW {
            return true;
        }

        let send_gap = ts.last_send_attempt.saturating_duration_since(ts.last_send);
        if send_gap > self.health.send_hang_detection
            && now.saturating_duration_since(ts.last_send_attempt) > SEND_HANG_GRACE_PERIOD
        {
            tracing::warn!(connection = %self.description, ?send_gap, "send appears hung");
            return false;
        }

        let receive_gap = ts.last_send.saturating_duration_since(ts.last_receive);
        if receive_gap > self.health.receive_hang_detection
            && now.saturating_duration_since(ts.last_send) > RECEIVE_HANG_GRACE_PERIOD
        {
            tracing::warn!(connection = %self.description, ?receive_gap, "receive appears hung");
            return false;
        }

        if let Some(idle_timeout) = self.health.idle_timeout {
            if now.saturating_duration_since(ts.last_receive) > idle_timeout {
                tracing::debug!(connection = %self.description, "connection idle");
                return false;
            }
        }

        self.probe_socket()
    }

    /// Zero-byte non-blocking send on the raw socket.
    fn probe_socket(&self) -> bool {
        match self.probe.send(&[]) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::debug!(connection = %self.description, error = %e, "socket probe failed");
                false
            }
        }
    }

    /// Time since the last send attempt, send and receive, for diagnostics.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let now = Instant::now();
        let ts = *self.timestamps.lock();
        ConnectionSnapshot {
            since_last_send_attempt: now.saturating_duration_since(ts.last_send_attempt),
            since_last_send: now.saturating_duration_since(ts.last_send),
            since_last_receive: now.saturating_duration_since(ts.last_receive),
            broken: self.is_broken(),
        }
    }

    /// Flags the connection as unusable. The pool evicts it on its next
    /// selection and [`write_request`](Self::write_request) refuses new frames.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Returns true once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Shuts the socket down, failing any blocked read or write, and
    /// returns the local port to the pool. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mark_broken();
        if let Err(e) = self.probe.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(connection = %self.description, error = %e, "socket shutdown failed");
            }
        }
        self.port_lease.lock().take();
        tracing::debug!(connection = %self.description, "connection disposed");
    }

    #[cfg(test)]
    fn set_timestamps(&self, ago_attempt: Duration, ago_send: Duration, ago_receive: Duration) {
        let now = Instant::now();
        *self.timestamps.lock() = Timestamps {
            last_send_attempt: now - ago_attempt,
            last_send: now - ago_send,
            last_receive: now - ago_receive,
        };
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("connection", &self.description)
            .field("tls", &self.is_tls)
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// Resolves the host and picks one of its addresses at random.
async fn resolve(
    address: &ServerAddress,
    target: &str,
    activity_id: Uuid,
) -> Result<SocketAddr, TransportError> {
    let dns_error = |message: String| {
        TransportError::new(TransportErrorCode::DnsResolutionFailed, target, message)
            .with_activity_id(activity_id)
    };

    let addresses: Vec<SocketAddr> = tokio::net::lookup_host((address.host(), address.port()))
        .await
        .map_err(|e| dns_error(format!("failed to resolve {}", address.host())).with_io(e))?
        .collect();

    let chosen = addresses.choose(&mut rand::thread_rng()).copied();
    chosen.ok_or_else(|| dns_error(format!("no addresses found for {}", address.host())))
}

/// Connects according to the port reuse mode. In private-port-pool mode the
/// local port is registered with the pool and released when the lease drops.
async fn connect(
    remote: SocketAddr,
    context: &TransportContext,
    target: &str,
    activity_id: Uuid,
) -> Result<(TcpStream, Option<PortLease>), TransportError> {
    let connect_error = |e: io::Error| {
        TransportError::new(
            TransportErrorCode::ConnectFailed,
            target,
            format!("failed to connect to {}", remote),
        )
        .with_activity_id(activity_id)
        .with_io(e)
    };

    if context.options().port_reuse_mode == PortReuseMode::ReuseUnicastPort {
        let tcp = connect_from(remote, None).await.map_err(connect_error)?;
        return Ok((tcp, None));
    }

    let pool = context.port_pool();
    let family = AddressFamily::of(&remote);

    if let Some(candidates) = pool.get_candidate_ports(family) {
        for port in candidates {
            match connect_from(remote, Some(port)).await {
                Ok(tcp) => {
                    pool.add_reference(family, port);
                    tracing::debug!(port, "bound to pooled port");
                    let lease = PortLease {
                        pool: Arc::clone(pool),
                        family,
                        port,
                    };
                    return Ok((tcp, Some(lease)));
                }
                Err(e) if is_port_conflict(&e) => {
                    tracing::debug!(port, error = %e, "pooled port unavailable");
                    pool.mark_unusable(family, port);
                }
                Err(e) => return Err(connect_error(e)),
            }
        }
        tracing::info!(
            usage = %pool.usage_summary(),
            "no pooled port could be used, falling back to an ephemeral port"
        );
    }

    let tcp = connect_from(remote, Some(0)).await.map_err(connect_error)?;
    let port = tcp.local_addr().map_err(connect_error)?.port();
    pool.add_reference(family, port);
    let lease = PortLease {
        pool: Arc::clone(pool),
        family,
        port,
    };
    Ok((tcp, Some(lease)))
}

async fn connect_from(remote: SocketAddr, local_port: Option<u16>) -> io::Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(port) = local_port {
        socket.set_reuseaddr(true)?;
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
            SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
        };
        socket.bind(local)?;
    }
    socket.connect(remote).await
}

fn is_port_conflict(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    )
}
