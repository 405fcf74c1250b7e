//! # rntbd-client
//!
//! Client transport for RNTBD.
//!
//! This crate provides:
//! - TCP/TLS connections with hang detection and source port reuse
//! - A dispatcher multiplexing calls over one connection by request id
//! - Channels racing every call against the request timeout
//! - Per-endpoint channel pools with admission control
//! - A [`TransportClient`] tying pools, authorization and routing together

pub mod address;
pub mod auth;
pub mod channel;
pub mod channel_dictionary;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod load_balancing;
pub mod options;
pub mod port_pool;
pub mod resolver;
pub mod stream;
pub mod tls;
pub mod transport_client;

#[cfg(test)]
pub(crate) mod test_support;

pub use address::ServerAddress;
pub use auth::{AuthorizationError, AuthorizationTokenProvider, NoAuthorization, StaticToken};
pub use channel::{race_timeout, Channel, ChannelState, Outcome};
pub use channel_dictionary::ChannelDictionary;
pub use connection::{Connection, ConnectionSnapshot};
pub use context::TransportContext;
pub use dispatcher::{Dispatcher, ServerProperties};
pub use error::{ClientError, NegotiationFailure, TransportError, TransportErrorCode};
pub use load_balancing::{LoadBalancingChannel, LoadBalancingPartition};
pub use options::{ConfigError, PortReuseMode, TlsOptions, TransportOptions};
pub use port_pool::{AddressFamily, PoolUsage, PortPoolUsage, UserPortPool};
pub use resolver::{AddressResolver, ServiceIdentity, StaticAddressResolver};
pub use transport_client::TransportClient;
