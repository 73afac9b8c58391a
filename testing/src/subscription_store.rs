//! An in-memory reference [`SubscriptionStorage`] (§4.I): a topic → subscriber
//! set, either centralized (any node may register on behalf of any
//! subscriber) or decentralized (a registration must come from the
//! subscriber it names).

use futures::future::BoxFuture;
use rustbus_core::subscription::{SubscriptionError, SubscriptionStorage};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// In-memory [`SubscriptionStorage`].
#[derive(Debug)]
pub struct InMemorySubscriptionStorage {
    subscribers: Mutex<HashMap<String, HashSet<String>>>,
    centralized: bool,
}

impl InMemorySubscriptionStorage {
    /// Build a centralized store: registration is broker-enforced, so any
    /// caller may register any subscriber for any topic.
    #[must_use]
    pub fn centralized() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()), centralized: true }
    }

    /// Build a decentralized store: registration is store-enforced, so a
    /// caller may only register or unregister the subscriber address it
    /// claims to be — `register_subscriber`/`unregister_subscriber` reject
    /// any other requester with [`SubscriptionError::NotOwner`].
    #[must_use]
    pub fn decentralized() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()), centralized: false }
    }

    fn check_owner(&self, subscriber_address: &str, requester: &str) -> Result<(), SubscriptionError> {
        if !self.centralized && requester != subscriber_address {
            return Err(SubscriptionError::NotOwner {
                requester: requester.to_string(),
                subscriber: subscriber_address.to_string(),
            });
        }
        Ok(())
    }
}

impl SubscriptionStorage for InMemorySubscriptionStorage {
    fn get_subscriber_addresses<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, SubscriptionError>> {
        Box::pin(async move {
            Ok(self
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(topic)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn register_subscriber<'a>(
        &'a self,
        topic: &'a str,
        subscriber_address: &'a str,
        requester: &'a str,
    ) -> BoxFuture<'a, Result<(), SubscriptionError>> {
        Box::pin(async move {
            self.check_owner(subscriber_address, requester)?;
            self.subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(topic.to_string())
                .or_default()
                .insert(subscriber_address.to_string());
            Ok(())
        })
    }

    fn unregister_subscriber<'a>(
        &'a self,
        topic: &'a str,
        subscriber_address: &'a str,
        requester: &'a str,
    ) -> BoxFuture<'a, Result<(), SubscriptionError>> {
        Box::pin(async move {
            self.check_owner(subscriber_address, requester)?;
            if let Some(set) = self
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get_mut(topic)
            {
                set.remove(subscriber_address);
            }
            Ok(())
        })
    }

    fn is_centralized(&self) -> bool {
        self.centralized
    }
}
