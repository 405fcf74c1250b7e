//! Channel pools for one server address.
//!
//! A [`LoadBalancingPartition`] owns a growable set of channels to a single
//! endpoint. The set lives in an immutable, versioned snapshot;
//! readers clone the current snapshot and mutations (growth, eviction) only
//! commit when the version they observed is still current.
//!
//! A [`LoadBalancingChannel`] fans requests for one address out over a fixed
//! number of partitions keyed by activity id.

use crate::address::ServerAddress;
use crate::channel::Channel;
use crate::context::TransportContext;
use crate::error::{ClientError, TransportError, TransportErrorCode};
use parking_lot::RwLock;
use rntbd_protocol::{RequestMessage, StoreResponse};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

struct PooledChannel {
    channel: Arc<Channel>,
    reservations: AtomicUsize,
}

impl PooledChannel {
    fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            reservations: AtomicUsize::new(0),
        }
    }

    /// Reserves a request slot unless the channel already carries `limit`.
    fn try_enter<'a>(self: &Arc<Self>, limit: usize, released: &'a Notify) -> Option<Reservation<'a>> {
        let mut current = self.reservations.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.reservations.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        pooled: Arc::clone(self),
                        released,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

struct Reservation<'a> {
    pooled: Arc<PooledChannel>,
    released: &'a Notify,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pooled.reservations.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_one();
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Immutable view of a partition's channels.
struct ChannelSnapshot {
    version: u64,
    channels: Vec<Arc<PooledChannel>>,
}

impl ChannelSnapshot {
    fn empty(version: u64) -> Self {
        Self {
            version,
            channels: Vec::new(),
        }
    }
}

/// Pool of channels to one endpoint with admission control.
pub struct LoadBalancingPartition {
    address: ServerAddress,
    context: Arc<TransportContext>,
    max_channels: usize,
    max_requests_per_channel: usize,
    snapshot: RwLock<Arc<ChannelSnapshot>>,
    pending: AtomicUsize,
    sequence: AtomicUsize,
    capacity_released: Notify,
    closed: AtomicBool,
}

impl LoadBalancingPartition {
    /// Creates an empty partition. Channels are opened on demand, up to
    /// `max_channels`, each carrying at most `max_requests_per_channel`
    /// requests at a time. Both limits are at least one.
    pub fn new(
        address: ServerAddress,
        context: Arc<TransportContext>,
        max_channels: usize,
        max_requests_per_channel: usize,
    ) -> Self {
        Self {
            address,
            context,
            max_channels: max_channels.max(1),
            max_requests_per_channel: max_requests_per_channel.max(1),
            snapshot: RwLock::new(Arc::new(ChannelSnapshot::empty(0))),
            pending: AtomicUsize::new(0),
            sequence: AtomicUsize::new(0),
            capacity_released: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Hard admission ceiling.
    pub fn max_capacity(&self) -> usize {
        self.max_channels * self.max_requests_per_channel
    }

    /// Number of channels in the current snapshot.
    pub fn channel_count(&self) -> usize {
        self.current().channels.len()
    }

    /// Requests admitted and not yet completed.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Sends `request` on one of the partition's channels.
    ///
    /// Fails fast with [`ClientError::RequestRateTooLarge`] when admitting
    /// it would exceed [`max_capacity`](Self::max_capacity). Otherwise picks
    /// a healthy channel with a free slot, evicting unhealthy ones and
    /// opening new ones as load grows, and waits for a slot when every
    /// channel is full.
    pub async fn request(
        &self,
        request: &RequestMessage,
        replica_path: &str,
    ) -> Result<StoreResponse, ClientError> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let _pending = PendingGuard(&self.pending);

        let ceiling = self.max_capacity();
        if pending > ceiling {
            tracing::debug!(
                address = %self.address,
                pending,
                ceiling,
                activity_id = %request.activity_id,
                "rejecting request over capacity"
            );
            return Err(ClientError::RequestRateTooLarge { pending, ceiling });
        }

        let (channel, _reservation) = self.acquire(request.activity_id).await?;
        channel.request(request, replica_path).await
    }

    async fn acquire(&self, activity_id: Uuid) -> Result<(Arc<Channel>, Reservation<'_>), ClientError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::new(
                    TransportErrorCode::ChannelClosed,
                    self.address.to_string(),
                    "channel pool is closed",
                )
                .with_activity_id(activity_id)
                .into());
            }

            // Registered before the scan so a release racing with it still wakes us.
            let released = self.capacity_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let snapshot = self.current();
            let count = snapshot.channels.len();
            let pending = self.pending.load(Ordering::Acquire);
            if pending > count * self.max_requests_per_channel && count < self.max_channels {
                self.grow(&snapshot, pending);
                continue;
            }

            let start = self.sequence.fetch_add(1, Ordering::Relaxed);
            let mut evicted = false;
            for offset in 0..count {
                let pooled = &snapshot.channels[(start + offset) % count];
                if !pooled.channel.healthy() {
                    self.evict(&snapshot, pooled);
                    evicted = true;
                    break;
                }
                if let Some(reservation) =
                    pooled.try_enter(self.max_requests_per_channel, &self.capacity_released)
                {
                    return Ok((Arc::clone(&pooled.channel), reservation));
                }
            }
            if evicted {
                continue;
            }

            released.await;
        }
    }

    fn current(&self) -> Arc<ChannelSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Opens channels until `pending` fits. A stale `observed` snapshot
    /// means another request changed the pool first; the caller re-reads.
    fn grow(&self, observed: &ChannelSnapshot, pending: usize) {
        let mut current = self.snapshot.write();
        if current.version != observed.version || self.closed.load(Ordering::Acquire) {
            return;
        }
        let target = pending
            .div_ceil(self.max_requests_per_channel)
            .min(self.max_channels);
        let existing = current.channels.len();
        if target <= existing {
            return;
        }

        let mut channels = current.channels.clone();
        for _ in existing..target {
            let channel = Channel::new(self.address.clone(), Arc::clone(&self.context));
            channel.initialize();
            channels.push(Arc::new(PooledChannel::new(channel)));
        }
        *current = Arc::new(ChannelSnapshot {
            version: current.version + 1,
            channels,
        });
        tracing::info!(
            "Opened {} channel(s) to {} ({} total, {} pending)",
            target - existing,
            self.address,
            target,
            pending
        );
        drop(current);
        self.capacity_released.notify_waiters();
    }

    /// Drops `victim` from the pool. In-flight requests keep their handle;
    /// the channel is disposed when the last one finishes.
    fn evict(&self, observed: &ChannelSnapshot, victim: &Arc<PooledChannel>) {
        let mut current = self.snapshot.write();
        if current.version != observed.version {
            return;
        }
        let channels: Vec<_> = current
            .channels
            .iter()
            .filter(|pooled| !Arc::ptr_eq(pooled, victim))
            .cloned()
            .collect();
        *current = Arc::new(ChannelSnapshot {
            version: current.version + 1,
            channels,
        });
        tracing::warn!(
            address = %self.address,
            state = ?victim.channel.state(),
            in_flight = victim.reservations.load(Ordering::Acquire),
            "evicting unhealthy channel"
        );
        drop(current);
        self.capacity_released.notify_waiters();
    }

    /// Closes every channel and rejects further requests.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = {
            let mut current = self.snapshot.write();
            let version = current.version + 1;
            std::mem::replace(&mut *current, Arc::new(ChannelSnapshot::empty(version)))
        };
        for pooled in &previous.channels {
            pooled.channel.close();
        }
        self.capacity_released.notify_waiters();
    }
}

/// Partitioned pool for one server address.
pub struct LoadBalancingChannel {
    address: ServerAddress,
    partitions: Vec<LoadBalancingPartition>,
}

impl std::fmt::Debug for LoadBalancingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancingChannel")
            .field("address", &self.address)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl LoadBalancingChannel {
    /// Splits the configured channel budget across `partition_count`
    /// partitions.
    pub fn new(address: ServerAddress, context: Arc<TransportContext>) -> Self {
        let options = context.options();
        let per_partition = options.max_channels_per_partition();
        let partitions = (0..options.partition_count.max(1))
            .map(|_| {
                LoadBalancingPartition::new(
                    address.clone(),
                    Arc::clone(&context),
                    per_partition,
                    options.max_requests_per_channel,
                )
            })
            .collect();
        Self { address, partitions }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Number of independent partitions requests are spread over.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition_index(&self, activity_id: Uuid) -> usize {
        if self.partitions.len() == 1 {
            return 0;
        }
        let (hi, lo) = activity_id.as_u64_pair();
        ((hi ^ lo) % self.partitions.len() as u64) as usize
    }

    /// Sends `request` through the partition its activity id maps to, so
    /// retries of one operation stay on the same partition.
    pub async fn request(
        &self,
        request: &RequestMessage,
        replica_path: &str,
    ) -> Result<StoreResponse, ClientError> {
        let partition = &self.partitions[self.partition_index(request.activity_id)];
        partition.request(request, replica_path).await
    }

    /// Channels open across all partitions.
    pub fn channel_count(&self) -> usize {
        self.partitions.iter().map(LoadBalancingPartition::channel_count).sum()
    }

    pub fn pending_requests(&self) -> usize {
        self.partitions
            .iter()
            .map(LoadBalancingPartition::pending_requests)
            .sum()
    }

    /// Closes every partition. Pending and future requests fail.
    pub fn close(&self) {
        for partition in &self.partitions {
            partition.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TransportOptions;
    use crate::test_support::{spawn_replica, Behavior};
    use rntbd_protocol::{OperationType, ResourceType};
    use std::time::Duration;

    fn context(options: TransportOptions) -> Arc<TransportContext> {
        TransportContext::new(options).unwrap()
    }

    fn read_request() -> RequestMessage {
        RequestMessage::new(ResourceType::Document, OperationType::Read)
            .with_resource_address("dbs/db/colls/c/docs/d")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_rejects_over_ceiling() {
        let replica = spawn_replica(Behavior {
            silent: true,
            ..Default::default()
        })
        .await;
        let ctx = context(TransportOptions::default().with_request_timeout(Duration::from_secs(1)));
        let partition = Arc::new(LoadBalancingPartition::new(replica.address.clone(), ctx, 1, 2));
        assert_eq!(partition.max_capacity(), 2);

        let mut waiting = Vec::new();
        for _ in 0..2 {
            let partition = Arc::clone(&partition);
            let path = replica.address.replica_path().to_string();
            waiting.push(tokio::spawn(async move {
                partition.request(&read_request(), &path).await
            }));
        }
        wait_until(|| replica.requests.load(Ordering::SeqCst) == 2).await;

        let err = partition
            .request(&read_request(), replica.address.replica_path())
            .await
            .unwrap_err();
        assert!(err.is_throttled());
        assert!(matches!(
            err,
            ClientError::RequestRateTooLarge { pending: 3, ceiling: 2 }
        ));
        assert_eq!(partition.channel_count(), 1);

        for task in waiting {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.is_timeout());
        }
        assert_eq!(partition.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_grows_with_load() {
        let replica = spawn_replica(Behavior {
            reply_delay: Duration::from_millis(200),
            ..Default::default()
        })
        .await;
        let partition = Arc::new(LoadBalancingPartition::new(
            replica.address.clone(),
            context(TransportOptions::default()),
            4,
            1,
        ));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let partition = Arc::clone(&partition);
            let path = replica.address.replica_path().to_string();
            tasks.push(tokio::spawn(async move {
                partition.request(&read_request(), &path).await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert!(response.is_success());
        }

        assert_eq!(partition.channel_count(), 4);
        assert_eq!(replica.connections.load(Ordering::SeqCst), 4);
        assert_eq!(partition.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_evicts_broken_channel() {
        let replica = spawn_replica(Behavior {
            close_first_after: Some(1),
            ..Default::default()
        })
        .await;
        let partition = LoadBalancingPartition::new(
            replica.address.clone(),
            context(TransportOptions::default()),
            2,
            4,
        );
        let path = replica.address.replica_path();

        partition.request(&read_request(), path).await.unwrap();
        assert_eq!(partition.channel_count(), 1);

        // The server drops the first connection once it has answered.
        let first = partition.current().channels[0].channel.clone();
        wait_until(|| !first.healthy()).await;

        let response = partition.request(&read_request(), path).await.unwrap();
        assert!(response.is_success());
        assert_eq!(partition.channel_count(), 1);
        assert_eq!(replica.connections.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&partition.current().channels[0].channel, &first));
    }

    #[tokio::test]
    async fn test_closed_partition_rejects() {
        let replica = spawn_replica(Behavior::default()).await;
        let partition = LoadBalancingPartition::new(
            replica.address.clone(),
            context(TransportOptions::default()),
            1,
            4,
        );
        let path = replica.address.replica_path();
        partition.request(&read_request(), path).await.unwrap();

        partition.close();
        partition.close();
        assert_eq!(partition.channel_count(), 0);
        let err = partition.request(&read_request(), path).await.unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ChannelClosed));
    }

    #[tokio::test]
    async fn test_partitioned_channel() {
        let replica = spawn_replica(Behavior::default()).await;
        let options = TransportOptions::default()
            .with_max_channels(8)
            .with_partition_count(4);
        let channel = LoadBalancingChannel::new(replica.address.clone(), context(options));
        assert_eq!(channel.partition_count(), 4);

        let activity_id = Uuid::new_v4();
        let index = channel.partition_index(activity_id);
        assert!(index < 4);
        assert_eq!(channel.partition_index(activity_id), index);
        assert_eq!(channel.partitions[index].max_capacity(), 2 * 30);

        let request = read_request().with_activity_id(activity_id);
        let response = channel
            .request(&request, replica.address.replica_path())
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(channel.channel_count(), 1);
        assert_eq!(channel.partitions[index].channel_count(), 1);

        channel.close();
        assert_eq!(channel.channel_count(), 0);
    }
}
