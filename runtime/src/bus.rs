//! The public send/publish/reply/defer/forward surface a handler body
//! invokes, and the facade that assembles every collaborator into a running
//! bus (§1 "worker scheduler" + §4.C outgoing pipeline + §4.J defer).
//!
//! A handler doesn't reach this through an ambient thread-local the way the
//! source language's base class does (Design Note §9) — it holds an
//! `Arc<Bus>` it was constructed with and calls `bus.send(tx, ...)` /
//! `bus.publish(tx, ...)` explicitly, passing the current transaction.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::handler::HandlerActivator;
use crate::pipeline::incoming::{
    ActivateHandlersStep, DeserializeStep, DispatchIncomingMessageStep, HandleDeferredMessagesStep,
    LoadSagaDataStep, SaveSagaDataStep,
};
use crate::pipeline::outgoing::{
    AssignDefaultHeadersStep, AutoCorrelateStep, SendOutgoingMessageStep, SerializeStep,
    INCOMING_CORRELATION_ID_KEY, OUTBOUND_DESTINATION_KEY, OUTBOUND_MESSAGE_KEY,
};
use crate::pipeline::{IncomingPipeline, OutgoingPipeline};
use crate::timeout_poller::{TimeoutPoller, DEFAULT_POLL_INTERVAL};
use crate::worker::WorkerPool;
use rustbus_core::environment::{Clock, IdGenerator};
use rustbus_core::headers::{LogicalMessage, RETURN_ADDRESS};
use rustbus_core::pipeline::StepContext;
use rustbus_core::router::Router;
use rustbus_core::saga::SagaStorage;
use rustbus_core::serializer::Serializer;
use rustbus_core::subscription::SubscriptionStorage;
use rustbus_core::timeout::TimeoutManager;
use rustbus_core::transaction::TransactionContext;
use rustbus_core::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Every collaborator a [`Bus`] needs, assembled once at startup and shared
/// by every worker and every handler's outgoing sends (§4.F, §4.C).
pub struct BusBuilder {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    router: Arc<dyn Router>,
    serializer: Arc<dyn Serializer>,
    saga_storage: Arc<dyn SagaStorage>,
    timeouts: Arc<dyn TimeoutManager>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    activator: HandlerActivator,
    subscriptions: Option<Arc<dyn SubscriptionStorage>>,
}

impl BusBuilder {
    /// Start assembling a bus from its required collaborators.
    #[must_use]
    pub fn new(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        router: Arc<dyn Router>,
        serializer: Arc<dyn Serializer>,
        saga_storage: Arc<dyn SagaStorage>,
        timeouts: Arc<dyn TimeoutManager>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            config,
            transport,
            router,
            serializer,
            saga_storage,
            timeouts,
            clock,
            ids,
            activator: HandlerActivator::new(),
            subscriptions: None,
        }
    }

    /// Attach a subscription store so [`Bus::subscribe`]/[`Bus::unsubscribe`]
    /// are available (§4.I). Not required for point-to-point-only buses.
    #[must_use]
    pub fn with_subscriptions(mut self, subscriptions: Arc<dyn SubscriptionStorage>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Register a plain message handler.
    #[must_use]
    pub fn register_handler(mut self, handler: Arc<dyn crate::handler::MessageHandler>) -> Self {
        self.activator.register_handler(handler);
        self
    }

    /// Register a saga handler.
    #[must_use]
    pub fn register_saga(mut self, handler: Arc<dyn crate::handler::SagaHandler>) -> Self {
        self.activator.register_saga(handler);
        self
    }

    /// Assemble the bus. Does not start worker loops; call [`Bus::start`].
    #[must_use]
    pub fn build(self) -> Arc<Bus> {
        let activator = Arc::new(self.activator);

        let incoming = Arc::new(IncomingPipeline::new(vec![
            Box::new(DeserializeStep::new(Arc::clone(&self.serializer))),
            Box::new(HandleDeferredMessagesStep::new(
                Arc::clone(&self.timeouts),
                Arc::clone(&self.clock),
            )),
            Box::new(ActivateHandlersStep::new(Arc::clone(&activator))),
            Box::new(LoadSagaDataStep::new(Arc::clone(&self.saga_storage))),
            Box::new(DispatchIncomingMessageStep::new(self.config.enable_idempotent_sagas)),
            Box::new(SaveSagaDataStep::new(Arc::clone(&self.saga_storage))),
        ]));

        let outgoing = Arc::new(OutgoingPipeline::new(vec![
            Box::new(AssignDefaultHeadersStep::new(
                Arc::clone(&self.ids),
                Arc::clone(&self.clock),
            )),
            Box::new(AutoCorrelateStep),
            Box::new(SerializeStep::new(Arc::clone(&self.serializer))),
            Box::new(SendOutgoingMessageStep::new(Arc::clone(&self.transport))),
        ]));

        Arc::new(Bus {
            config: self.config,
            transport: self.transport,
            router: self.router,
            timeouts: self.timeouts,
            subscriptions: self.subscriptions,
            incoming_pipeline: incoming,
            outgoing_pipeline: outgoing,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    workers: WorkerPool,
    timeout_poller: TimeoutPoller,
}

/// An assembled bus: owns the pipelines, the transport, and (once started)
/// the worker pool and timeout poller.
///
/// Handlers reach `send`/`publish`/`reply`/`forward` through the `Arc<Bus>`
/// they were constructed with, rather than an ambient context (Design Note
/// §9) — every call takes the current message's [`TransactionContext`]
/// explicitly, so an outgoing send is always attributed to the transaction
/// whose commit will flush it.
pub struct Bus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    router: Arc<dyn Router>,
    timeouts: Arc<dyn TimeoutManager>,
    subscriptions: Option<Arc<dyn SubscriptionStorage>>,
    incoming_pipeline: Arc<IncomingPipeline>,
    outgoing_pipeline: Arc<OutgoingPipeline>,
    running: Mutex<Option<Running>>,
}

impl Bus {
    /// Start the worker pool and the timeout poller. A no-op if already
    /// running.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let workers = WorkerPool::start(
            &self.config,
            Arc::clone(&self.transport),
            Arc::clone(&self.incoming_pipeline),
        );
        let timeout_poller = TimeoutPoller::start(
            Arc::clone(&self.timeouts),
            Arc::clone(&self.transport),
            DEFAULT_POLL_INTERVAL,
        );

        *running = Some(Running { workers, timeout_poller });
    }

    /// Gracefully stop the worker pool and timeout poller, waiting up to
    /// `grace` for in-flight messages to finish (§4.F "Shutdown").
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.workers.shutdown(grace).await;
            running.timeout_poller.shutdown().await;
        }
    }

    /// Send `body` to the queue [`Router::route_to_destination`] resolves
    /// for `message_type`, buffered on `tx`'s outbox until commit.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if routing, serialization, or the buffering send
    /// call fails.
    pub async fn send(
        &self,
        tx: &TransactionContext,
        message_type: &str,
        body: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), BusError> {
        let destination = self.router.route_to_destination(message_type).await?;
        self.run_outgoing(tx, &destination, message_type, body, headers, None)
            .await
    }

    /// Publish `body` to every subscriber [`Router::route_to_subscribers`]
    /// resolves for `topic`, buffered on `tx`'s outbox until commit.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if subscriber resolution, serialization, or any
    /// buffering send call fails.
    pub async fn publish(
        &self,
        tx: &TransactionContext,
        topic: &str,
        body: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), BusError> {
        let subscribers = self.router.route_to_subscribers(topic).await?;
        for destination in subscribers {
            self.run_outgoing(tx, &destination, topic, body.clone(), headers.clone(), None)
                .await?;
        }
        Ok(())
    }

    /// Subscribe this bus's own transport address to `topic` (§4.I). The
    /// requester passed to the subscription store is always this node's own
    /// address — a decentralized store rejects a registration for any other
    /// subscriber address, since only a node may register itself.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSubscriptionStorage`] if this bus was built
    /// without [`BusBuilder::with_subscriptions`], or
    /// [`BusError::Subscription`] if the store rejects the registration.
    pub async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        let subscriptions = self
            .subscriptions
            .as_ref()
            .ok_or(BusError::NoSubscriptionStorage)?;
        let own_address = self.own_address()?;
        subscriptions
            .register_subscriber(topic, own_address, own_address)
            .await?;
        Ok(())
    }

    /// Unsubscribe this bus's own transport address from `topic` (§4.I).
    /// Same ownership rule as [`Bus::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoSubscriptionStorage`] if this bus was built
    /// without [`BusBuilder::with_subscriptions`], or
    /// [`BusError::Subscription`] if the store rejects the request.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        let subscriptions = self
            .subscriptions
            .as_ref()
            .ok_or(BusError::NoSubscriptionStorage)?;
        let own_address = self.own_address()?;
        subscriptions
            .unregister_subscriber(topic, own_address, own_address)
            .await?;
        Ok(())
    }

    fn own_address(&self) -> Result<&str, BusError> {
        self.transport.address().ok_or_else(|| {
            BusError::Routing(rustbus_core::router::RoutingError::NoRouteForType(
                "this transport has no receive address to subscribe with".to_string(),
            ))
        })
    }

    /// Reply to `incoming` by sending `body` to its `rbs2-return-address`,
    /// auto-correlating onto its `rbs2-corr-id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Routing`] (wrapping
    /// [`rustbus_core::router::RoutingError::NoRouteForType`]) if `incoming`
    /// carries no return address, or any error [`Bus::send`] can surface.
    pub async fn reply(
        &self,
        tx: &TransactionContext,
        incoming: &LogicalMessage,
        message_type: &str,
        body: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), BusError> {
        let destination = incoming.headers.get(RETURN_ADDRESS).cloned().ok_or_else(|| {
            BusError::Routing(rustbus_core::router::RoutingError::NoRouteForType(
                "no rbs2-return-address on incoming message".to_string(),
            ))
        })?;
        self.run_outgoing(
            tx,
            &destination,
            message_type,
            body,
            headers,
            incoming.correlation_id().map(str::to_string),
        )
        .await
    }

    /// Forward `incoming` verbatim to `destination` with `extra_headers`
    /// merged in (seed scenario 5: "forward to error queue"). The source
    /// delivery is removed the same way any other handled message is: by
    /// the worker committing `tx` after this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if serialization or the buffering send call
    /// fails.
    pub async fn forward(
        &self,
        tx: &TransactionContext,
        incoming: &LogicalMessage,
        destination: &str,
        extra_headers: HashMap<String, String>,
    ) -> Result<(), BusError> {
        let mut headers = incoming.headers.clone();
        headers.extend(extra_headers);
        let message_type = incoming.message_type().unwrap_or("").to_string();
        self.run_outgoing(tx, destination, &message_type, incoming.body.clone(), headers, None)
            .await
    }

    /// Defer `body`/`headers` until `due_at` via the timeout manager (§4.J).
    /// `headers` must carry `rbs2-defer-recipient` for the poller to know
    /// where to re-send it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] if the store write fails.
    pub async fn defer(
        &self,
        due_at: DateTime<Utc>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        self.timeouts.defer(due_at, headers, body).await?;
        Ok(())
    }

    async fn run_outgoing(
        &self,
        tx: &TransactionContext,
        destination: &str,
        message_type: &str,
        body: Vec<u8>,
        mut headers: HashMap<String, String>,
        incoming_correlation_id: Option<String>,
    ) -> Result<(), BusError> {
        headers.insert(
            rustbus_core::headers::MSG_TYPE.to_string(),
            message_type.to_string(),
        );

        let ctx = StepContext::new();
        ctx.insert(OUTBOUND_DESTINATION_KEY, destination.to_string());
        ctx.insert(
            OUTBOUND_MESSAGE_KEY,
            std::sync::Mutex::new(LogicalMessage::new(body, headers)),
        );
        if let Some(corr_id) = incoming_correlation_id {
            ctx.insert(INCOMING_CORRELATION_ID_KEY, corr_id);
        }

        self.outgoing_pipeline.run(&ctx, tx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::environment::{SystemClock, UuidIdGenerator};
    use crate::router::TypeMapRouter;
    use futures::future::BoxFuture;
    use rustbus_core::saga::{SagaData, SagaError};
    use rustbus_core::timeout::{DueMessageBatch, TimeoutStoreError};
    use rustbus_core::transport::TransportError;
    use std::collections::HashMap as StdHashMap;

    struct NullTransport;
    impl Transport for NullTransport {
        fn create_queue(&self, _address: &str) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn send(
            &self,
            _destination: &str,
            _message: rustbus_core::headers::TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn receive<'a>(
            &'a self,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<Option<rustbus_core::headers::TransportMessage>, TransportError>>
        {
            Box::pin(async { Ok(None) })
        }
        fn address(&self) -> Option<&str> {
            None
        }
    }

    struct AddressedNullTransport(String);
    impl Transport for AddressedNullTransport {
        fn create_queue(&self, _address: &str) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn send(
            &self,
            _destination: &str,
            _message: rustbus_core::headers::TransportMessage,
            _tx: &TransactionContext,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
        fn receive<'a>(
            &'a self,
            _tx: &'a TransactionContext,
        ) -> BoxFuture<'a, Result<Option<rustbus_core::headers::TransportMessage>, TransportError>>
        {
            Box::pin(async { Ok(None) })
        }
        fn address(&self) -> Option<&str> {
            Some(&self.0)
        }
    }

    struct NullSagaStore;
    impl SagaStorage for NullSagaStore {
        fn find<'a>(
            &'a self,
            _data_type: &'a str,
            _property_path: &'a str,
            _value: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<Option<SagaData>, SagaError>> {
            Box::pin(async { Ok(None) })
        }
        fn insert<'a>(
            &'a self,
            _data: &'a SagaData,
            _correlations: &'a [rustbus_core::saga::CorrelationValue],
        ) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async { Ok(()) })
        }
        fn update<'a>(
            &'a self,
            _data: &'a SagaData,
            _correlations: &'a [rustbus_core::saga::CorrelationValue],
        ) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async { Ok(()) })
        }
        fn delete<'a>(&'a self, _data: &'a SagaData) -> BoxFuture<'a, Result<(), SagaError>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct NullTimeouts;
    impl TimeoutManager for NullTimeouts {
        fn defer<'a>(
            &'a self,
            _due_at: DateTime<Utc>,
            _headers: StdHashMap<String, String>,
            _body: Vec<u8>,
        ) -> BoxFuture<'a, Result<(), TimeoutStoreError>> {
            Box::pin(async { Ok(()) })
        }
        fn get_due_messages(&self) -> BoxFuture<'_, Result<Box<dyn DueMessageBatch>, TimeoutStoreError>> {
            Box::pin(async { Err(TimeoutStoreError::StoreError("unused in test".to_string())) })
        }
    }

    struct PassthroughSerializer;
    impl Serializer for PassthroughSerializer {
        fn serialize(
            &self,
            message: LogicalMessage,
        ) -> BoxFuture<'_, Result<rustbus_core::headers::TransportMessage, rustbus_core::serializer::FormatError>>
        {
            Box::pin(async move {
                Ok(rustbus_core::headers::TransportMessage::new(message.body, message.headers))
            })
        }
        fn deserialize(
            &self,
            message: rustbus_core::headers::TransportMessage,
        ) -> BoxFuture<'_, Result<LogicalMessage, rustbus_core::serializer::FormatError>> {
            Box::pin(async move { Ok(LogicalMessage::new(message.body, message.headers)) })
        }
    }

    fn test_bus() -> Arc<Bus> {
        let mut routes = StdHashMap::new();
        routes.insert("Ping".to_string(), "pings".to_string());
        BusBuilder::new(
            BusConfig::builder().build().unwrap(),
            Arc::new(NullTransport),
            Arc::new(TypeMapRouter::new(routes)),
            Arc::new(PassthroughSerializer),
            Arc::new(NullSagaStore),
            Arc::new(NullTimeouts),
            Arc::new(SystemClock),
            Arc::new(UuidIdGenerator),
        )
        .build()
    }

    #[tokio::test]
    async fn send_resolves_route_and_assigns_msg_id() {
        let bus = test_bus();
        let tx = TransactionContext::new();
        bus.send(&tx, "Ping", b"hi".to_vec(), StdHashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_unknown_type_fails_routing() {
        let bus = test_bus();
        let tx = TransactionContext::new();
        let err = bus
            .send(&tx, "Unknown", Vec::new(), StdHashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Routing(_)));
    }

    #[tokio::test]
    async fn reply_without_return_address_fails() {
        let bus = test_bus();
        let tx = TransactionContext::new();
        let incoming = LogicalMessage::new(Vec::new(), StdHashMap::new());
        let err = bus
            .reply(&tx, &incoming, "Pong", Vec::new(), StdHashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Routing(_)));
    }

    #[tokio::test]
    async fn subscribe_without_subscription_storage_fails() {
        let bus = test_bus();
        let err = bus.subscribe("orders").await.unwrap_err();
        assert!(matches!(err, BusError::NoSubscriptionStorage));
    }

    #[tokio::test]
    async fn subscribe_registers_this_nodes_own_address() {
        let subscriptions: Arc<dyn SubscriptionStorage> =
            Arc::new(rustbus_testing::InMemorySubscriptionStorage::decentralized());
        let bus = BusBuilder::new(
            BusConfig::builder().build().unwrap(),
            Arc::new(AddressedNullTransport("my-queue".to_string())),
            Arc::new(TypeMapRouter::new(StdHashMap::new())),
            Arc::new(PassthroughSerializer),
            Arc::new(NullSagaStore),
            Arc::new(NullTimeouts),
            Arc::new(SystemClock),
            Arc::new(UuidIdGenerator),
        )
        .with_subscriptions(Arc::clone(&subscriptions))
        .build();

        bus.subscribe("orders").await.unwrap();

        assert_eq!(
            subscriptions.get_subscriber_addresses("orders").await.unwrap(),
            vec!["my-queue".to_string()]
        );

        bus.unsubscribe("orders").await.unwrap();
        assert!(subscriptions.get_subscriber_addresses("orders").await.unwrap().is_empty());
    }
}
