//! Resources shared by every channel of one transport client.

use crate::error::ClientError;
use crate::options::TransportOptions;
use crate::port_pool::UserPortPool;
use crate::tls::create_tls_connector;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Validated options plus the port pool and TLS connector built from them.
/// Owned by a [`TransportClient`](crate::TransportClient) and passed down to
/// each channel and connection it opens.
pub struct TransportContext {
    options: TransportOptions,
    port_pool: Arc<UserPortPool>,
    tls: Option<TlsConnector>,
}

impl TransportContext {
    pub fn new(options: TransportOptions) -> Result<Arc<Self>, ClientError> {
        options.validate()?;
        let tls = if options.tls.enabled {
            Some(create_tls_connector(&options.tls)?)
        } else {
            None
        };
        let port_pool = Arc::new(UserPortPool::new(
            options.port_pool_reuse_threshold,
            options.port_pool_bind_attempts,
        ));

        tracing::debug!(
            tls = options.tls.enabled,
            port_reuse_mode = ?options.port_reuse_mode,
            max_channels = options.max_channels,
            partitions = options.partition_count,
            "transport context created"
        );

        Ok(Arc::new(Self {
            options,
            port_pool,
            tls,
        }))
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn port_pool(&self) -> &Arc<UserPortPool> {
        &self.port_pool
    }

    pub fn tls_connector(&self) -> Option<&TlsConnector> {
        self.tls.as_ref()
    }
}
