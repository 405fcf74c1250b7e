//! Entry point for sending requests to replicas.

use crate::address::ServerAddress;
use crate::auth::{AuthorizationError, AuthorizationTokenProvider, NoAuthorization};
use crate::channel_dictionary::ChannelDictionary;
use crate::context::TransportContext;
use crate::error::ClientError;
use crate::options::TransportOptions;
use crate::port_pool::PortPoolUsage;
use crate::resolver::{AddressResolver, ServiceIdentity};
use rntbd_protocol::{RequestMessage, StoreResponse};
use rntbd_routing::{CollectionRoutingMap, PartitionKeyDefinition, PartitionKeyInternal};
use std::sync::Arc;
use std::time::Instant;

const AUTHORIZATION: &str = "authorization";
const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";

/// Owns the channel pools, port pool and TLS setup for one logical client.
///
/// Dropping or [closing](TransportClient::close) the client closes every
/// channel it opened.
pub struct TransportClient {
    context: Arc<TransportContext>,
    channels: ChannelDictionary,
    authorization: Arc<dyn AuthorizationTokenProvider>,
}

impl TransportClient {
    pub fn new(options: TransportOptions) -> Result<Self, ClientError> {
        let context = TransportContext::new(options)?;
        Ok(Self {
            channels: ChannelDictionary::new(Arc::clone(&context)),
            context,
            authorization: Arc::new(NoAuthorization),
        })
    }

    pub fn with_authorization(mut self, provider: Arc<dyn AuthorizationTokenProvider>) -> Self {
        self.authorization = provider;
        self
    }

    pub fn options(&self) -> &TransportOptions {
        self.context.options()
    }

    /// Sends `request` to the replica at `address`.
    pub async fn invoke(
        &self,
        address: &ServerAddress,
        mut request: RequestMessage,
    ) -> Result<StoreResponse, ClientError> {
        self.authorize(&mut request)?;
        let channel = self.channels.get_channel(address)?;

        let started = Instant::now();
        let result = channel.request(&request, address.replica_path()).await;
        match &result {
            Ok(response) => tracing::debug!(
                address = %address,
                activity_id = %request.activity_id,
                status = %response.status,
                elapsed = ?started.elapsed(),
                "request completed"
            ),
            Err(e) => tracing::warn!(
                address = %address,
                activity_id = %request.activity_id,
                operation = ?request.operation_type,
                payload_sent = e.payload_sent(),
                error = %e,
                "request failed"
            ),
        }
        result
    }

    /// Routes `request` by partition key and sends it to the preferred
    /// replica of the owning range.
    pub async fn invoke_for_partition_key(
        &self,
        routing_map: &CollectionRoutingMap<ServiceIdentity>,
        definition: &PartitionKeyDefinition,
        partition_key: &PartitionKeyInternal,
        resolver: &dyn AddressResolver,
        mut request: RequestMessage,
    ) -> Result<StoreResponse, ClientError> {
        let effective_partition_key = partition_key.effective_partition_key(definition)?;
        let range = routing_map
            .get_range_by_effective_partition_key(&effective_partition_key)
            .ok_or_else(|| {
                ClientError::NoRoute(format!(
                    "no partition key range owns '{}'",
                    effective_partition_key
                ))
            })?;
        let identity = routing_map.try_get_info_by_id(&range.id).ok_or_else(|| {
            ClientError::NoRoute(format!("no service identity for range '{}'", range.id))
        })?;

        let addresses = resolver.resolve(range, identity).await?;
        let address = addresses.first().ok_or_else(|| {
            ClientError::NoRoute(format!("no replicas serve range '{}'", range.id))
        })?;
        tracing::trace!(
            %effective_partition_key,
            range = %range.id,
            %address,
            "routed request"
        );

        if request.header(PARTITION_KEY).is_none() && !partition_key.is_empty() {
            request.set_header(PARTITION_KEY, partition_key.to_json());
        }
        request.set_header(PARTITION_KEY_RANGE_ID, range.id.as_str());
        self.invoke(address, request).await
    }

    /// Sets the authorization header unless the caller already did. An
    /// `Unauthorized` answer for the given address retries with the
    /// name-based form.
    fn authorize(&self, request: &mut RequestMessage) -> Result<(), ClientError> {
        if request.header(AUTHORIZATION).is_some() {
            return Ok(());
        }
        let method = request.operation_type.http_method();
        let resource_path = request.resource_type.path_segment();
        let token = match self.authorization.token(
            &request.resource_address,
            resource_path,
            method,
            &request.headers,
        ) {
            Ok(token) => token,
            Err(AuthorizationError::Unauthorized(reason)) => {
                tracing::debug!(
                    resource = %request.resource_address,
                    %reason,
                    "retrying authorization with name-based address"
                );
                self.authorization
                    .name_based_token(&request.resource_address, resource_path, method, &request.headers)
                    .map_err(|e| ClientError::Authorization(e.to_string()))?
            }
            Err(e) => return Err(ClientError::Authorization(e.to_string())),
        };
        if !token.is_empty() {
            request.set_header(AUTHORIZATION, token);
        }
        Ok(())
    }

    pub fn port_pool_usage(&self) -> PortPoolUsage {
        self.context.port_pool().usage()
    }

    pub fn usage_summary(&self) -> String {
        self.context.port_pool().usage_summary()
    }

    /// Number of endpoints with a channel pool.
    pub fn endpoint_count(&self) -> usize {
        self.channels.len()
    }

    pub fn close(&self) {
        self.channels.close();
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.channels.close();
    }
}
