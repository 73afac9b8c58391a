//! Saga data, correlation properties, and the saga storage contract (§4.K).
//!
//! Correlation resolves an incoming message to a saga instance without the
//! coordinator (in `rustbus_runtime`) knowing anything about the shape of
//! the saga data itself: a [`CorrelationProperty`] names a path on the data
//! and an extractor over the message, and the store indexes
//! `(saga_data_type, property_path, value) -> saga_id`.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a [`SagaStorage`] implementation.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// The store could not be read or written.
    #[error("saga store error: {0}")]
    StoreError(String),

    /// An `Update` or `Delete` targeted a revision that no longer matches
    /// the stored row — another worker updated it first. The caller must
    /// abort the owning transaction and let the message be redelivered.
    #[error("concurrency conflict on saga {id} at expected revision {expected_revision}")]
    ConcurrencyConflict {
        /// The saga id whose revision no longer matched.
        id: String,
        /// The revision the caller expected to still be current.
        expected_revision: u64,
    },
}

/// Opaque saga-owned data plus the two reserved fields the coordinator and
/// store both need to reason about: a stable id and an OCC revision.
#[derive(Clone, Debug)]
pub struct SagaData {
    /// Globally unique id, assigned on first insert.
    pub id: String,
    /// Monotonically increasing revision, starting at 0. Bumped on every
    /// successful update.
    pub revision: u64,
    /// The type name of the user saga data this record holds — used as the
    /// first component of a correlation lookup key.
    pub data_type: String,
    /// The saga-defined payload, serialized so the store need not know its
    /// shape.
    pub payload: Value,
}

impl SagaData {
    /// Construct a fresh, unsaved saga instance at revision 0.
    #[must_use]
    pub fn new_initial(id: String, data_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            revision: 0,
            data_type: data_type.into(),
            payload,
        }
    }
}

/// A `(property_path, value)` pair read out of a [`SagaData`] payload at
/// save time, for every [`CorrelationProperty`] registered against that
/// data's `data_type`. Passed to [`SagaStorage::insert`]/[`SagaStorage::update`]
/// so the store can maintain its `(data_type, property_path, value) -> id`
/// secondary index and enforce the one-saga-per-correlation-value invariant
/// (§3 `CorrelationProperty`, §4.K).
#[derive(Clone, Debug)]
pub struct CorrelationValue {
    /// The JSON-pointer-style path on the saga payload this value came from.
    pub property_path: String,
    /// The value stored at that path when `insert`/`update` was called.
    pub value: Value,
}

/// Normalize a correlation property path so `"/order_id"` and bare
/// `"order_id"` address the same payload location and the same index entry.
#[must_use]
pub fn json_pointer(property_path: &str) -> String {
    if property_path.starts_with('/') {
        property_path.to_string()
    } else {
        format!("/{property_path}")
    }
}

/// Derive the `(property_path, value)` pairs for `data` from every
/// `properties` entry registered against `data.data_type`, reading each
/// value directly out of `data.payload` rather than from an incoming
/// message — unlike the correlate-on-receive lookup in
/// `rustbus_runtime::saga_coordinator::load_saga_data`, the save path has no
/// message to extract from, only the saga's own current state. A property
/// path with no value yet present in the payload is skipped.
#[must_use]
pub fn correlation_values_for(data: &SagaData, properties: &[CorrelationProperty]) -> Vec<CorrelationValue> {
    let mut seen = std::collections::HashSet::new();
    let mut values = Vec::new();
    for property in properties {
        if property.saga_data_type != data.data_type {
            continue;
        }
        if !seen.insert(property.property_path.clone()) {
            continue;
        }
        if let Some(value) = data.payload.pointer(&json_pointer(&property.property_path)) {
            values.push(CorrelationValue {
                property_path: property.property_path.clone(),
                value: value.clone(),
            });
        }
    }
    values
}

/// `(saga-data-type, property-path-on-data, message-type, extractor)`.
///
/// Invariant: for a given `(saga_data_type, message_type)` pair, at least one
/// correlation property must be registered, or messages of that type can
/// neither initiate nor continue the saga.
pub struct CorrelationProperty {
    /// The saga data type this property indexes.
    pub saga_data_type: String,
    /// The JSON-pointer-style path into the saga payload this property
    /// reads (e.g. `/order_id`).
    pub property_path: String,
    /// The logical message type this extractor applies to.
    pub message_type: String,
    /// Pulls the correlation value out of a deserialized message body.
    pub extractor: Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>,
}

impl std::fmt::Debug for CorrelationProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationProperty")
            .field("saga_data_type", &self.saga_data_type)
            .field("property_path", &self.property_path)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

/// Persists and locates [`SagaData`] by id or by correlation value.
pub trait SagaStorage: Send + Sync {
    /// Find the saga of `data_type` whose payload has `value` at
    /// `property_path`. Returns the first match, or `None`.
    fn find<'a>(
        &'a self,
        data_type: &'a str,
        property_path: &'a str,
        value: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SagaData>, SagaError>> + Send + 'a>>;

    /// Insert a freshly created saga at revision 0, indexing `correlations`
    /// so a later `find` on any of them resolves to `data.id`.
    ///
    /// # Errors
    ///
    /// [`SagaError::ConcurrencyConflict`] if `data.id` already exists, or if
    /// any `(data.data_type, correlation.property_path, correlation.value)`
    /// already indexes a different saga — "Insert of a `(correlationProperty,
    /// value)` collides with an existing saga of the same type" (§4.K).
    fn insert<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + 'a>>;

    /// Update an existing saga, succeeding only if the stored revision still
    /// equals `data.revision`; on success the stored revision becomes
    /// `data.revision + 1` and the correlation index is refreshed to
    /// `correlations` (stale entries from a previous revision are dropped).
    ///
    /// # Errors
    ///
    /// [`SagaError::ConcurrencyConflict`] if the stored revision has moved
    /// on.
    fn update<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + 'a>>;

    /// Delete a completed saga, succeeding only if the stored revision still
    /// equals `data.revision`.
    ///
    /// # Errors
    ///
    /// [`SagaError::ConcurrencyConflict`] if the stored revision has moved
    /// on.
    fn delete<'a>(
        &'a self,
        data: &'a SagaData,
    ) -> Pin<Box<dyn Future<Output = Result<(), SagaError>> + Send + 'a>>;
}
