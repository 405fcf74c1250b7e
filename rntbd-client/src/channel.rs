//! A channel owns one dispatcher and bounds every call with a timeout.
//!
//! Channels start in `New`, move to `Opening` on [`Channel::initialize`], and
//! settle in `Open` or `Closed`. Requests issued while opening wait for the
//! outcome; requests on a channel that failed to open observe the failure.

use crate::address::ServerAddress;
use crate::connection::ConnectionSnapshot;
use crate::context::TransportContext;
use crate::dispatcher::{Dispatcher, ServerProperties};
use crate::error::{ClientError, TransportError, TransportErrorCode};
use rntbd_protocol::{RequestMessage, StoreResponse};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Result of racing an operation against a timer.
#[derive(Debug)]
pub enum Outcome<T, E, D> {
    Success(T),
    /// The timer won; carries diagnostics captured at expiry.
    TimedOut(D),
    Failed(E),
}

/// Races `future` against `timeout`. The loser is dropped before this returns.
pub async fn race_timeout<T, E, D, F>(
    timeout: Duration,
    future: F,
    diagnostics: impl FnOnce() -> D,
) -> Outcome<T, E, D>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        result = future => match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failed(e),
        },
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut(diagnostics()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Opening,
    Open,
    Closed,
}

#[derive(Clone)]
enum ChannelStatus {
    New,
    Opening,
    Open(Arc<Dispatcher>),
    /// Carries the open failure, or `None` when closed by the owner.
    Closed(Option<TransportError>),
}

impl ChannelStatus {
    fn state(&self) -> ChannelState {
        match self {
            ChannelStatus::New => ChannelState::New,
            ChannelStatus::Opening => ChannelState::Opening,
            ChannelStatus::Open(_) => ChannelState::Open,
            ChannelStatus::Closed(_) => ChannelState::Closed,
        }
    }
}

pub struct Channel {
    address: ServerAddress,
    context: Arc<TransportContext>,
    status: watch::Sender<ChannelStatus>,
}

impl Channel {
    pub fn new(address: ServerAddress, context: Arc<TransportContext>) -> Arc<Self> {
        let (status, _) = watch::channel(ChannelStatus::New);
        Arc::new(Self {
            address,
            context,
            status,
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state()
    }

    /// Starts opening in the background. Only the first call has an effect.
    pub fn initialize(self: &Arc<Self>) {
        let started = self.status.send_if_modified(|status| {
            if matches!(status, ChannelStatus::New) {
                *status = ChannelStatus::Opening;
                true
            } else {
                false
            }
        });
        if started {
            let channel = Arc::clone(self);
            tokio::spawn(async move { channel.open_dispatcher().await });
        }
    }

    async fn open_dispatcher(&self) {
        let activity_id = Uuid::new_v4();
        let timeout = self.context.options().open_timeout();
        tracing::debug!(address = %self.address, %activity_id, "opening channel");

        let outcome = race_timeout(
            timeout,
            Dispatcher::open(&self.address, activity_id, &self.context),
            || timeout,
        )
        .await;

        let next = match outcome {
            Outcome::Success(dispatcher) => {
                tracing::info!(
                    address = %self.address,
                    connection = %dispatcher.connection().description(),
                    "channel open"
                );
                ChannelStatus::Open(Arc::new(dispatcher))
            }
            Outcome::Failed(e) => {
                tracing::error!(address = %self.address, error = %e, "channel open failed");
                ChannelStatus::Closed(Some(e))
            }
            Outcome::TimedOut(timeout) => {
                tracing::error!(address = %self.address, ?timeout, "channel open timed out");
                ChannelStatus::Closed(Some(
                    TransportError::new(
                        TransportErrorCode::ChannelOpenTimeout,
                        self.address.to_string(),
                        format!("channel open timed out after {:?}", timeout),
                    )
                    .with_activity_id(activity_id),
                ))
            }
        };

        let mut discarded = None;
        self.status.send_modify(|status| {
            if matches!(status, ChannelStatus::Opening) {
                *status = next;
            } else {
                discarded = Some(next);
            }
        });
        // Closed while opening.
        if let Some(ChannelStatus::Open(dispatcher)) = discarded {
            dispatcher.dispose();
        }
    }

    /// Waits for the open to settle and returns the dispatcher.
    async fn dispatcher(self: &Arc<Self>) -> Result<Arc<Dispatcher>, TransportError> {
        self.initialize();
        let mut status = self.status.subscribe();
        let settled = status
            .wait_for(|s| !matches!(s, ChannelStatus::New | ChannelStatus::Opening))
            .await
            .map(|s| (*s).clone());

        match settled {
            Ok(ChannelStatus::Open(dispatcher)) => Ok(dispatcher),
            Ok(ChannelStatus::Closed(Some(e))) => Err(e),
            _ => Err(TransportError::new(
                TransportErrorCode::ChannelClosed,
                self.address.to_string(),
                "channel is closed",
            )),
        }
    }

    /// Opens the channel if needed and waits for the result.
    pub async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        self.dispatcher().await.map(|_| ())
    }

    /// Sends one request and waits at most the request timeout for its response.
    pub async fn request(
        self: &Arc<Self>,
        request: &RequestMessage,
        replica_path: &str,
    ) -> Result<StoreResponse, ClientError> {
        let dispatcher = self
            .dispatcher()
            .await
            .map_err(|e| e.with_activity_id(request.activity_id))?;
        let prepared = dispatcher.prepare_call(request, replica_path)?;
        let timeout = self.context.options().request_timeout();

        let outcome = race_timeout(timeout, dispatcher.call(&prepared), || dispatcher.snapshot()).await;
        match outcome {
            Outcome::Success(response) => Ok(response),
            Outcome::Failed(e) => Err(e),
            Outcome::TimedOut(snapshot) => {
                dispatcher.cancel_call(prepared.request_id());
                dispatcher.connection().mark_broken();
                tracing::warn!(
                    address = %self.address,
                    request_id = prepared.request_id(),
                    activity_id = %request.activity_id,
                    %snapshot,
                    "request timed out"
                );
                Err(timeout_error(&self.address, &dispatcher, timeout, snapshot)
                    .with_activity_id(request.activity_id)
                    .with_payload_sent(prepared.payload_sent())
                    .into())
            }
        }
    }

    /// Whether the pool should keep selecting this channel. Channels still
    /// opening count as healthy.
    pub fn healthy(&self) -> bool {
        match &*self.status.borrow() {
            ChannelStatus::Open(dispatcher) => dispatcher.healthy(),
            ChannelStatus::New | ChannelStatus::Opening => true,
            ChannelStatus::Closed(_) => false,
        }
    }

    pub fn pending_calls(&self) -> usize {
        match &*self.status.borrow() {
            ChannelStatus::Open(dispatcher) => dispatcher.pending_calls(),
            _ => 0,
        }
    }

    pub fn server_properties(&self) -> Option<ServerProperties> {
        match &*self.status.borrow() {
            ChannelStatus::Open(dispatcher) => Some(dispatcher.server_properties().clone()),
            _ => None,
        }
    }

    pub fn connection_description(&self) -> Option<String> {
        match &*self.status.borrow() {
            ChannelStatus::Open(dispatcher) => {
                Some(dispatcher.connection().description().to_string())
            }
            _ => None,
        }
    }

    /// Closes the channel, cancelling its pending calls. Idempotent.
    pub fn close(&self) {
        let previous = self.status.send_replace(ChannelStatus::Closed(None));
        if let ChannelStatus::Open(dispatcher) = previous {
            tracing::debug!(address = %self.address, "closing channel");
            dispatcher.dispose();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let ChannelStatus::Open(dispatcher) = &*self.status.borrow() {
            dispatcher.dispose();
        }
    }
}

fn timeout_error(
    address: &ServerAddress,
    dispatcher: &Dispatcher,
    timeout: Duration,
    snapshot: ConnectionSnapshot,
) -> TransportError {
    TransportError::new(
        TransportErrorCode::RequestTimeout,
        address.to_string(),
        format!("request timed out after {:?} ({})", timeout, snapshot),
    )
    .with_connection(dispatcher.connection().description())
}
