//! An in-memory reference [`SagaStorage`] (§4.K, §6): "a `HashMap` keyed by
//! id with a secondary map `(type, property, value) -> id`", as spec.md's
//! reference-backend shape names it. The secondary map is what makes the
//! correlation-collision invariant enforceable on `insert`: two sagas of the
//! same type can never register the same `(property_path, value)`.

use futures::future::BoxFuture;
use rustbus_core::saga::{json_pointer, CorrelationValue, SagaData, SagaError, SagaStorage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// A stored saga plus the correlation index keys it currently owns, so
/// `update`/`delete` can retract exactly the entries `insert`/`update` added.
#[derive(Debug, Clone)]
struct Row {
    data: SagaData,
    index_keys: Vec<String>,
}

/// In-memory [`SagaStorage`] enforcing both invariants a relational store
/// must: the OCC revision check on every write, and correlation-collision
/// rejection on `insert` via the secondary index.
#[derive(Debug, Default)]
pub struct InMemorySagaStorage {
    sagas: Mutex<HashMap<String, Row>>,
    correlation_index: Mutex<HashMap<String, String>>,
}

impl InMemorySagaStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sagas currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the store holds no sagas.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The secondary map's composite key: `data_type`, normalized
/// `property_path`, and the value's canonical JSON text (`serde_json::Value`
/// has no `Hash` impl, so the index is keyed on its serialized form).
fn index_key(data_type: &str, property_path: &str, value: &Value) -> String {
    format!("{data_type}\u{1}{}\u{1}{value}", json_pointer(property_path))
}

impl SagaStorage for InMemorySagaStorage {
    fn find<'a>(
        &'a self,
        data_type: &'a str,
        property_path: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, Result<Option<SagaData>, SagaError>> {
        Box::pin(async move {
            let key = index_key(data_type, property_path, value);
            let index = self.correlation_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(id) = index.get(&key) else {
                return Ok(None);
            };
            let sagas = self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Ok(sagas.get(id).map(|row| row.data.clone()))
        })
    }

    fn insert<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            let mut sagas = self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if sagas.contains_key(&data.id) {
                return Err(SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: data.revision,
                });
            }

            let mut index = self.correlation_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let keys: Vec<String> = correlations
                .iter()
                .map(|c| index_key(&data.data_type, &c.property_path, &c.value))
                .collect();
            if keys.iter().any(|key| index.contains_key(key)) {
                return Err(SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: data.revision,
                });
            }

            for key in &keys {
                index.insert(key.clone(), data.id.clone());
            }
            sagas.insert(
                data.id.clone(),
                Row {
                    data: data.clone(),
                    index_keys: keys,
                },
            );
            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        data: &'a SagaData,
        correlations: &'a [CorrelationValue],
    ) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            let mut sagas = self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match sagas.get(&data.id) {
                Some(row) if row.data.revision == data.revision => {
                    let mut index = self.correlation_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    for key in &row.index_keys {
                        index.remove(key);
                    }
                    let new_keys: Vec<String> = correlations
                        .iter()
                        .map(|c| index_key(&data.data_type, &c.property_path, &c.value))
                        .collect();
                    for key in &new_keys {
                        index.insert(key.clone(), data.id.clone());
                    }

                    let mut updated = data.clone();
                    updated.revision += 1;
                    sagas.insert(
                        data.id.clone(),
                        Row {
                            data: updated,
                            index_keys: new_keys,
                        },
                    );
                    Ok(())
                }
                Some(row) => Err(SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: row.data.revision,
                }),
                None => Err(SagaError::StoreError(format!("no saga with id {}", data.id))),
            }
        })
    }

    fn delete<'a>(&'a self, data: &'a SagaData) -> BoxFuture<'a, Result<(), SagaError>> {
        Box::pin(async move {
            let mut sagas = self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match sagas.get(&data.id) {
                Some(row) if row.data.revision == data.revision => {
                    let mut index = self.correlation_index.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    for key in &row.index_keys {
                        index.remove(key);
                    }
                    sagas.remove(&data.id);
                    Ok(())
                }
                Some(row) => Err(SagaError::ConcurrencyConflict {
                    id: data.id.clone(),
                    expected_revision: row.data.revision,
                }),
                None => Err(SagaError::StoreError(format!("no saga with id {}", data.id))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn saga(id: &str, order_id: &str) -> SagaData {
        SagaData::new_initial(id.to_string(), "OrderSaga", json!({ "order_id": order_id }))
    }

    fn order_id_correlation(order_id: &str) -> Vec<CorrelationValue> {
        vec![CorrelationValue {
            property_path: "order_id".to_string(),
            value: Value::String(order_id.to_string()),
        }]
    }

    #[tokio::test]
    async fn insert_then_find_by_correlation_property() {
        let store = InMemorySagaStorage::new();
        store.insert(&saga("s1", "order-42"), &order_id_correlation("order-42")).await.unwrap();

        let found = store
            .find("OrderSaga", "order_id", &Value::String("order-42".to_string()))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "s1");
    }

    #[tokio::test]
    async fn insert_twice_with_same_id_conflicts() {
        let store = InMemorySagaStorage::new();
        store.insert(&saga("s1", "order-42"), &order_id_correlation("order-42")).await.unwrap();
        let err = store.insert(&saga("s1", "order-99"), &order_id_correlation("order-99")).await.unwrap_err();
        assert!(matches!(err, SagaError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn insert_with_colliding_correlation_value_conflicts() {
        let store = InMemorySagaStorage::new();
        store.insert(&saga("s1", "order-42"), &order_id_correlation("order-42")).await.unwrap();

        let err = store
            .insert(&saga("s2", "order-42"), &order_id_correlation("order-42"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::ConcurrencyConflict { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_with_stale_revision_conflicts() {
        let store = InMemorySagaStorage::new();
        let mut data = saga("s1", "order-42");
        let correlations = order_id_correlation("order-42");
        store.insert(&data, &correlations).await.unwrap();

        store.update(&data, &correlations).await.unwrap();
        let err = store.update(&data, &correlations).await.unwrap_err();
        assert!(matches!(err, SagaError::ConcurrencyConflict { expected_revision: 1, .. }));

        data.revision = 1;
        store.update(&data, &correlations).await.unwrap();
    }

    #[tokio::test]
    async fn update_refreshes_correlation_index() {
        let store = InMemorySagaStorage::new();
        let data = saga("s1", "order-42");
        store.insert(&data, &order_id_correlation("order-42")).await.unwrap();

        let mut moved = saga("s1", "order-43");
        moved.revision = 0;
        store.update(&moved, &order_id_correlation("order-43")).await.unwrap();

        assert!(store
            .find("OrderSaga", "order_id", &Value::String("order-42".to_string()))
            .await
            .unwrap()
            .is_none());
        let found = store
            .find("OrderSaga", "order_id", &Value::String("order-43".to_string()))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "s1");
    }

    #[tokio::test]
    async fn delete_removes_matching_revision() {
        let store = InMemorySagaStorage::new();
        let data = saga("s1", "order-42");
        let correlations = order_id_correlation("order-42");
        store.insert(&data, &correlations).await.unwrap();
        store.delete(&data).await.unwrap();
        assert!(store.is_empty());
        assert!(store
            .find("OrderSaga", "order_id", &Value::String("order-42".to_string()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_with_stale_revision_conflicts() {
        let store = InMemorySagaStorage::new();
        let data = saga("s1", "order-42");
        let correlations = order_id_correlation("order-42");
        store.insert(&data, &correlations).await.unwrap();
        store.update(&data, &correlations).await.unwrap();

        let err = store.delete(&data).await.unwrap_err();
        assert!(matches!(err, SagaError::ConcurrencyConflict { .. }));
    }
}
