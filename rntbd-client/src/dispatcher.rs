//! Request multiplexing over one connection.
//!
//! Callers register a completion handle under a fresh transport request id,
//! write their frame and wait. A single receive loop reads responses in wire
//! order and completes the handle whose id the server echoed. When the loop
//! stops, every handle still registered is completed with a failure.

use crate::address::ServerAddress;
use crate::connection::{Connection, ConnectionSnapshot};
use crate::context::TransportContext;
use crate::error::{ClientError, NegotiationFailure, TransportError, TransportErrorCode};
use crate::options::TransportOptions;
use bytes::BytesMut;
use parking_lot::Mutex;
use rntbd_protocol::{ContextRequest, Encoder, RequestMessage, ResponseFrame, StoreResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// What the server reported during context negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerProperties {
    pub agent: String,
    pub version: String,
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
enum CallFailure {
    /// The dispatcher was shut down.
    Cancelled,
    Transport(TransportError),
}

type CallResult = Result<ResponseFrame, CallFailure>;

#[derive(Default)]
struct CallTable {
    calls: HashMap<u32, oneshot::Sender<CallResult>>,
    /// Set once the receive loop has stopped; no new calls are accepted.
    closed: Option<CallFailure>,
}

/// Completes every pending call with `failure` and closes the table.
fn drain(calls: &Mutex<CallTable>, failure: CallFailure) -> usize {
    let pending: Vec<_> = {
        let mut table = calls.lock();
        if table.closed.is_none() {
            table.closed = Some(failure.clone());
        }
        table.calls.drain().collect()
    };
    let count = pending.len();
    for (_, completion) in pending {
        let _ = completion.send(Err(failure.clone()));
    }
    count
}

/// A request framed and assigned a transport request id, ready to send.
pub struct PreparedCall {
    request_id: u32,
    activity_id: Uuid,
    frame: BytesMut,
    sent: AtomicBool,
}

impl PreparedCall {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Whether the frame was completely written.
    pub fn payload_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

/// Removes a call's entry when its caller stops waiting.
struct Registration<'a> {
    calls: &'a Mutex<CallTable>,
    request_id: u32,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.calls.lock().calls.remove(&self.request_id);
    }
}

pub struct Dispatcher {
    connection: Arc<Connection>,
    calls: Arc<Mutex<CallTable>>,
    next_request_id: AtomicU32,
    server: ServerProperties,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connection", &self.connection)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Opens the connection, negotiates the protocol context and starts the
    /// receive loop.
    pub async fn open(
        address: &ServerAddress,
        activity_id: Uuid,
        context: &TransportContext,
    ) -> Result<Self, TransportError> {
        let connection = Arc::new(Connection::open(address, activity_id, context).await?);
        let server = negotiate(&connection, activity_id, context.options()).await?;

        tracing::info!(
            connection = %connection.description(),
            server_agent = %server.agent,
            server_version = %server.version,
            "context negotiated"
        );

        let calls = Arc::new(Mutex::new(CallTable::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(receive_loop(
            Arc::clone(&connection),
            Arc::clone(&calls),
            shutdown_rx,
        ));

        Ok(Self {
            connection,
            calls,
            next_request_id: AtomicU32::new(1),
            server,
            shutdown,
            disposed: AtomicBool::new(false),
        })
    }

    /// Id 0 belongs to context negotiation and is never handed out. Once
    /// the counter wraps, ids still waiting for a response are skipped.
    fn next_request_id(&self) -> u32 {
        let table = self.calls.lock();
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !table.calls.contains_key(&id) {
                return id;
            }
        }
    }

    /// Frames a request. Header validation failures surface here, before
    /// any I/O.
    pub fn prepare_call(
        &self,
        request: &RequestMessage,
        replica_path: &str,
    ) -> Result<PreparedCall, ClientError> {
        let request_id = self.next_request_id();
        let frame = Encoder::build_request(request, replica_path, request_id)?;
        Ok(PreparedCall {
            request_id,
            activity_id: request.activity_id,
            frame,
            sent: AtomicBool::new(false),
        })
    }

    /// Sends a prepared call and waits for its response.
    ///
    /// Dropping the returned future removes the call from the table. If the
    /// frame was only partly written at that point, the connection is
    /// marked broken.
    pub async fn call(&self, prepared: &PreparedCall) -> Result<StoreResponse, ClientError> {
        let request_id = prepared.request_id;
        let (completion, response) = oneshot::channel();
        {
            let mut table = self.calls.lock();
            if let Some(failure) = &table.closed {
                return Err(self.closed_error(failure, prepared.activity_id));
            }
            table.calls.insert(request_id, completion);
        }
        let _registration = Registration {
            calls: &self.calls,
            request_id,
        };

        self.connection
            .write_request(&prepared.frame, prepared.activity_id)
            .await?;
        prepared.sent.store(true, Ordering::Release);
        tracing::debug!(request_id, activity_id = %prepared.activity_id, "request sent");

        match response.await {
            Ok(Ok(frame)) => Ok(StoreResponse::from_frame(frame)),
            Ok(Err(CallFailure::Cancelled)) => Err(ClientError::Cancelled),
            Ok(Err(CallFailure::Transport(e))) => Err(e
                .with_activity_id(prepared.activity_id)
                .with_payload_sent(true)
                .into()),
            Err(_) => Err(TransportError::new(
                TransportErrorCode::ConnectionBroken,
                self.connection.target(),
                "call removed before a response arrived",
            )
            .with_activity_id(prepared.activity_id)
            .with_connection(self.connection.description())
            .with_payload_sent(true)
            .into()),
        }
    }

    fn closed_error(&self, failure: &CallFailure, activity_id: Uuid) -> ClientError {
        let error = match failure {
            CallFailure::Cancelled => TransportError::new(
                TransportErrorCode::DispatcherShutdown,
                self.connection.target(),
                "dispatcher is shut down",
            )
            .with_connection(self.connection.description()),
            CallFailure::Transport(e) => e.clone(),
        };
        error.with_activity_id(activity_id).with_payload_sent(false).into()
    }

    /// Removes a call whose caller gave up. A late response is discarded.
    pub fn cancel_call(&self, request_id: u32) -> bool {
        self.calls.lock().calls.remove(&request_id).is_some()
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.lock().calls.len()
    }

    pub fn has_pending_call(&self, request_id: u32) -> bool {
        self.calls.lock().calls.contains_key(&request_id)
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().closed.is_some()
    }

    pub fn healthy(&self) -> bool {
        !self.is_closed() && self.connection.healthy()
    }

    pub fn server_properties(&self) -> &ServerProperties {
        &self.server
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    /// Stops the receive loop, cancels pending calls and closes the
    /// connection. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let cancelled = drain(&self.calls, CallFailure::Cancelled);
        self.connection.dispose();
        tracing::debug!(
            connection = %self.connection.description(),
            cancelled,
            "dispatcher disposed"
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn negotiate(
    connection: &Connection,
    activity_id: Uuid,
    options: &TransportOptions,
) -> Result<ServerProperties, TransportError> {
    let negotiation_error = |message: String| {
        TransportError::new(
            TransportErrorCode::TransportNegotiationFailed,
            connection.target(),
            message,
        )
        .with_activity_id(activity_id)
        .with_connection(connection.description())
    };

    let request = ContextRequest::new(options.client_version.as_str(), options.user_agent.as_str());
    let frame = request
        .encode(activity_id)
        .map_err(|e| negotiation_error(format!("failed to encode context request: {}", e)))?;
    tracing::debug!("Sending context request ({} bytes)", frame.len());
    connection.write_request(&frame, activity_id).await?;

    let response = connection
        .read_context_response()
        .await
        .map_err(|e| e.with_activity_id(activity_id))?;

    if !response.is_accepted() {
        let message = response.failure_message();
        tracing::error!(
            connection = %connection.description(),
            status = %response.status,
            error = %message,
            "context negotiation rejected"
        );
        let failure = NegotiationFailure {
            status: response.status,
            code: response.error.as_ref().map(|e| e.code.clone()),
            message: message.clone(),
            required_protocol_version: response.protocol_version,
            required_client_version: response.client_version.clone(),
        };
        return Err(negotiation_error(format!(
            "context negotiation rejected with status {}: {}",
            response.status, message
        ))
        .with_negotiation(failure));
    }

    Ok(ServerProperties {
        agent: response.server_agent.unwrap_or_default(),
        version: response.server_version.unwrap_or_default(),
        idle_timeout: response.idle_timeout,
    })
}

async fn receive_loop(
    connection: Arc<Connection>,
    calls: Arc<Mutex<CallTable>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(connection = %connection.description(), "receive loop started");

    let failure = loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break CallFailure::Cancelled,
            result = connection.read_response() => match result {
                Ok(frame) => complete(&calls, frame),
                Err(e) => {
                    connection.mark_broken();
                    tracing::warn!(
                        connection = %connection.description(),
                        error = %e,
                        "receive loop failed"
                    );
                    let mut broken = TransportError::new(
                        TransportErrorCode::ConnectionBroken,
                        connection.target(),
                        format!("connection broken: {}: {}", e.code, e.message),
                    )
                    .with_connection(connection.description());
                    broken.source = e.source;
                    break CallFailure::Transport(broken);
                }
            },
        }
    };

    let drained = drain(&calls, failure);
    tracing::debug!(
        connection = %connection.description(),
        drained,
        "receive loop stopped"
    );
}

fn complete(calls: &Mutex<CallTable>, frame: ResponseFrame) {
    let Some(request_id) = frame.transport_request_id() else {
        tracing::warn!(status = frame.status(), "response without a transport request id");
        return;
    };
    let completion = calls.lock().calls.remove(&request_id);
    match completion {
        Some(completion) => {
            let _ = completion.send(Ok(frame));
        }
        None => {
            tracing::debug!(request_id, "discarding response for a call no longer pending");
        }
    }
}
