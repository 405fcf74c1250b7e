//! Address-keyed registry of channel pools.

use crate::address::ServerAddress;
use crate::context::TransportContext;
use crate::error::{ClientError, TransportError, TransportErrorCode};
use crate::load_balancing::LoadBalancingChannel;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lazily creates one [`LoadBalancingChannel`] per server authority.
pub struct ChannelDictionary {
    context: Arc<TransportContext>,
    channels: DashMap<String, Arc<LoadBalancingChannel>>,
    closed: AtomicBool,
}

impl ChannelDictionary {
    pub fn new(context: Arc<TransportContext>) -> Self {
        Self {
            context,
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the pool for `address`, creating it on first use.
    pub fn get_channel(&self, address: &ServerAddress) -> Result<Arc<LoadBalancingChannel>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::new(
                TransportErrorCode::ChannelClosed,
                address.to_string(),
                "transport client is closed",
            )
            .into());
        }

        let key = address.authority();
        if let Some(existing) = self.channels.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        // Construction opens nothing, so a racing loser simply drops its copy.
        let candidate = Arc::new(LoadBalancingChannel::new(
            address.clone(),
            Arc::clone(&self.context),
        ));
        let channel = Arc::clone(self.channels.entry(key).or_insert(candidate).value());

        // A close that raced with the insert has already swept the map.
        if self.closed.load(Ordering::Acquire) {
            channel.close();
        }
        Ok(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every pool ever handed out. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = self.channels.len();
        for entry in self.channels.iter() {
            entry.value().close();
        }
        self.channels.clear();
        tracing::debug!(endpoints = count, "channel dictionary closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TransportOptions;

    fn dictionary() -> ChannelDictionary {
        ChannelDictionary::new(TransportContext::new(TransportOptions::default()).unwrap())
    }

    #[test]
    fn test_same_authority_shares_pool() {
        let dictionary = dictionary();
        let a = ServerAddress::parse("rntbd://replica-1:443/apps/a/services/s/partitions/p/replicas/1p/").unwrap();
        let b = ServerAddress::parse("rntbd://replica-1:443/apps/a/services/s/partitions/p/replicas/2s/").unwrap();
        let c = ServerAddress::parse("rntbd://replica-2:443/").unwrap();

        let first = dictionary.get_channel(&a).unwrap();
        let second = dictionary.get_channel(&b).unwrap();
        let third = dictionary.get_channel(&c).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(dictionary.len(), 2);
    }

    #[test]
    fn test_concurrent_creation_yields_one_pool() {
        let dictionary = Arc::new(dictionary());
        let address = ServerAddress::parse("rntbd://replica-1:443/").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dictionary = Arc::clone(&dictionary);
                let address = address.clone();
                std::thread::spawn(move || dictionary.get_channel(&address).unwrap())
            })
            .collect();
        let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for channel in &channels[1..] {
            assert!(Arc::ptr_eq(&channels[0], channel));
        }
        assert_eq!(dictionary.len(), 1);
    }

    #[test]
    fn test_closed_dictionary_rejects() {
        let dictionary = dictionary();
        let address = ServerAddress::parse("rntbd://replica-1:443/").unwrap();
        dictionary.get_channel(&address).unwrap();

        dictionary.close();
        dictionary.close();
        assert!(dictionary.is_closed());
        assert!(dictionary.is_empty());

        let err = dictionary.get_channel(&address).unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ChannelClosed));
    }
}
