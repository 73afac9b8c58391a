//! Two reference [`Router`] implementations (§4.H): an explicit
//! type-to-destination map for point-to-point sends, and a topic router
//! backed by [`SubscriptionStorage`] for publishes.

use futures::future::BoxFuture;
use rustbus_core::router::{Router, RoutingError};
use rustbus_core::subscription::SubscriptionStorage;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes by an explicit, statically configured `message_type → destination`
/// map. Publishes are not meaningful without a topology, so
/// `route_to_subscribers` always fails with [`RoutingError::NoRouteForType`]
/// unless a subscription storage is also layered on top via
/// [`NativeTopicRouter`].
pub struct TypeMapRouter {
    routes: HashMap<String, String>,
}

impl TypeMapRouter {
    /// Build a router from an explicit `message_type → destination` map.
    #[must_use]
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }
}

impl Router for TypeMapRouter {
    fn route_to_destination<'a>(
        &'a self,
        message_type: &'a str,
    ) -> BoxFuture<'a, Result<String, RoutingError>> {
        Box::pin(async move {
            self.routes
                .get(message_type)
                .cloned()
                .ok_or_else(|| RoutingError::NoRouteForType(message_type.to_string()))
        })
    }

    fn route_to_subscribers<'a>(
        &'a self,
        message_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, RoutingError>> {
        Box::pin(async move { Err(RoutingError::NoRouteForType(message_type.to_string())) })
    }
}

/// Routes point-to-point sends through an explicit type map, but resolves
/// publishes by asking a [`SubscriptionStorage`] for a topic's subscriber
/// addresses — either broker-native (centralized) or store-backed
/// (decentralized), per §4.I.
pub struct NativeTopicRouter {
    destinations: HashMap<String, String>,
    subscriptions: Arc<dyn SubscriptionStorage>,
}

impl NativeTopicRouter {
    /// Build a router with an explicit point-to-point map and a subscription
    /// backend for publishes.
    #[must_use]
    pub fn new(
        destinations: HashMap<String, String>,
        subscriptions: Arc<dyn SubscriptionStorage>,
    ) -> Self {
        Self {
            destinations,
            subscriptions,
        }
    }
}

impl Router for NativeTopicRouter {
    fn route_to_destination<'a>(
        &'a self,
        message_type: &'a str,
    ) -> BoxFuture<'a, Result<String, RoutingError>> {
        Box::pin(async move {
            self.destinations
                .get(message_type)
                .cloned()
                .ok_or_else(|| RoutingError::NoRouteForType(message_type.to_string()))
        })
    }

    fn route_to_subscribers<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, RoutingError>> {
        Box::pin(async move {
            self.subscriptions
                .get_subscriber_addresses(topic)
                .await
                .map_err(|err| RoutingError::SubscriberResolutionFailed(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn type_map_router_resolves_registered_destination() {
        let mut routes = HashMap::new();
        routes.insert("OrderPlaced".to_string(), "orders-queue".to_string());
        let router = TypeMapRouter::new(routes);

        assert_eq!(
            router.route_to_destination("OrderPlaced").await.unwrap(),
            "orders-queue"
        );
    }

    #[tokio::test]
    async fn type_map_router_unknown_type_fails() {
        let router = TypeMapRouter::new(HashMap::new());
        assert!(router.route_to_destination("Unknown").await.is_err());
    }
}
