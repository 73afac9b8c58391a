//! The router contract: message type → destination (§4.H).
//!
//! Two modes exist conceptually: explicit type-map routing, and
//! transport-native topic routing where the transport itself owns
//! subscription resolution (§4.I). Both are expressed through the same
//! trait; `rustbus-runtime` ships one implementation of each.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while resolving a route.
#[derive(Error, Debug, Clone)]
pub enum RoutingError {
    /// No destination is registered for the given message type.
    #[error("no route registered for message type {0:?}")]
    NoRouteForType(String),

    /// The underlying subscription storage failed to resolve subscribers.
    #[error("subscriber resolution failed: {0}")]
    SubscriberResolutionFailed(String),
}

/// Resolves the destination(s) for an outgoing message.
pub trait Router: Send + Sync {
    /// Resolve the single point-to-point destination queue for
    /// `message_type`.
    fn route_to_destination<'a>(
        &'a self,
        message_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, RoutingError>> + Send + 'a>>;

    /// Resolve every subscriber queue for a publish to `topic`.
    fn route_to_subscribers<'a>(
        &'a self,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, RoutingError>> + Send + 'a>>;
}
