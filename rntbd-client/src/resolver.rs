//! Partition to replica address resolution.

use crate::address::ServerAddress;
use crate::error::ClientError;
use async_trait::async_trait;
use parking_lot::RwLock;
use rntbd_routing::PartitionKeyRange;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies the service instance backing a partition key range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub federation_id: String,
    pub service_name: String,
    #[serde(default)]
    pub is_master_service: bool,
}

impl ServiceIdentity {
    pub fn new(federation_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            federation_id: federation_id.into(),
            service_name: service_name.into(),
            is_master_service: false,
        }
    }
}

/// Maps a partition key range to the replicas currently serving it.
///
/// Implementations typically cache gateway lookups. The first address
/// returned is the preferred replica.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(
        &self,
        range: &PartitionKeyRange,
        identity: &ServiceIdentity,
    ) -> Result<Vec<ServerAddress>, ClientError>;
}

/// Resolver backed by a fixed table keyed by range id.
#[derive(Default)]
pub struct StaticAddressResolver {
    addresses: RwLock<HashMap<String, Vec<ServerAddress>>>,
}

impl StaticAddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(self, range_id: impl Into<String>, addresses: Vec<ServerAddress>) -> Self {
        self.set(range_id, addresses);
        self
    }

    pub fn set(&self, range_id: impl Into<String>, addresses: Vec<ServerAddress>) {
        self.addresses.write().insert(range_id.into(), addresses);
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn resolve(
        &self,
        range: &PartitionKeyRange,
        _identity: &ServiceIdentity,
    ) -> Result<Vec<ServerAddress>, ClientError> {
        self.addresses
            .read()
            .get(&range.id)
            .cloned()
            .ok_or_else(|| ClientError::NoRoute(format!("no addresses for partition key range '{}'", range.id)))
    }
}
