//! Subscription storage contract: topic → subscriber queues (§4.I).
//!
//! In "centralized" mode the record is derived from the broker's native
//! topology and any node may register/unregister on behalf of any
//! subscriber (the broker enforces fan-out). In decentralized mode the
//! record lives in the subscription store and only the subscriber node
//! itself may register for its own address.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a [`SubscriptionStorage`] implementation.
#[derive(Error, Debug, Clone)]
pub enum SubscriptionError {
    /// The store could not be read or written.
    #[error("subscription store error: {0}")]
    StoreError(String),

    /// A decentralized store rejected a registration made on behalf of a
    /// different subscriber than the caller.
    #[error("decentralized store rejected registration by {requester:?} on behalf of {subscriber:?}")]
    NotOwner {
        /// The node attempting the registration.
        requester: String,
        /// The subscriber address the registration was attempted for.
        subscriber: String,
    },
}

/// `(topic, subscriber_address)` with set semantics — no duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// The topic subscribed to.
    pub topic: String,
    /// The address that should receive publishes to `topic`.
    pub subscriber_address: String,
}

/// Topic → subscriber-queue registry.
pub trait SubscriptionStorage: Send + Sync {
    /// All subscriber addresses currently registered for `topic`.
    fn get_subscriber_addresses<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, SubscriptionError>> + Send + 'a>>;

    /// Register `subscriber_address` for `topic`, on behalf of `requester`.
    /// Idempotent (no duplicate entries result from registering twice).
    ///
    /// In decentralized mode, a store must reject this with
    /// [`SubscriptionError::NotOwner`] when `requester != subscriber_address`
    /// — only a subscriber may register itself. A centralized store, where
    /// the broker itself enforces fan-out, accepts any requester.
    fn register_subscriber<'a>(
        &'a self,
        topic: &'a str,
        subscriber_address: &'a str,
        requester: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>>;

    /// Remove `subscriber_address` from `topic`'s subscriber set, if
    /// present, on behalf of `requester`. Same ownership rule as
    /// [`SubscriptionStorage::register_subscriber`].
    fn unregister_subscriber<'a>(
        &'a self,
        topic: &'a str,
        subscriber_address: &'a str,
        requester: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>>;

    /// Whether registration is broker-enforced (centralized, any node may
    /// register on behalf of any subscriber) or store-enforced
    /// (decentralized, only the subscriber itself may register).
    fn is_centralized(&self) -> bool;
}
