//! Deterministic idempotency keys and the local result cache.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use saga_store::{IdempotencyRecord, SagaData, SagaId};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields that change between logically identical requests and are never hashed.
pub const VOLATILE_FIELDS: &[&str] = &[
    "timestamp",
    "nonce",
    "request_id",
    "created_at",
    "updated_at",
];

/// Prefix separating compensation keys from forward keys.
pub const COMPENSATION_PREFIX: &str = "comp:";

/// Computes `sha256(saga_id, step_name, stable_params(data))` as hex.
///
/// Object keys are hashed in sorted order, so the key does not depend on the
/// order fields were inserted.
pub fn idempotency_key(saga_id: SagaId, step_name: &str, data: &SagaData) -> String {
    let stable = stable_params(&Value::Object(data.clone()));
    let mut hasher = Sha256::new();
    hasher.update(saga_id.as_uuid().as_bytes());
    hasher.update([0]);
    hasher.update(step_name.as_bytes());
    hasher.update([0]);
    hasher.update(stable.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// The key under which a step's compensation result is cached.
pub fn compensation_key(forward_key: &str) -> String {
    format!("{COMPENSATION_PREFIX}{forward_key}")
}

/// Strips volatile fields at every nesting level.
pub fn stable_params(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), stable_params(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(stable_params).collect()),
        other => other.clone(),
    }
}

/// Bounded in-process cache in front of the remote idempotency store.
///
/// Oldest entries are evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct LocalCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    records: HashMap<String, IdempotencyRecord>,
    order: VecDeque<String>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the cached record unless it has expired.
    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let mut inner = self.inner.lock();
        let record = inner.records.get(key)?;
        if record.is_expired(Utc::now()) {
            inner.records.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        Some(record.clone())
    }

    pub fn insert(&self, record: IdempotencyRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let key = record.key.clone();
        if inner.records.insert(key.clone(), record).is_none() {
            inner.order.push_back(key);
        }
        while inner.records.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.records.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.order.retain(|k| k != key);
        inner.records.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn data(value: Value) -> SagaData {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_key_is_deterministic() {
        let saga_id = SagaId::new();
        let d = data(json!({"order_id": "o-1", "amount": 42}));
        assert_eq!(
            idempotency_key(saga_id, "pay", &d),
            idempotency_key(saga_id, "pay", &d)
        );
        assert_eq!(idempotency_key(saga_id, "pay", &d).len(), 64);
    }

    #[test]
    fn test_key_ignores_volatile_fields() {
        let saga_id = SagaId::new();
        let a = data(json!({"order_id": "o-1", "timestamp": "2024-01-01", "nonce": 1}));
        let b = data(json!({"order_id": "o-1", "timestamp": "2025-06-30", "nonce": 99}));
        assert_eq!(
            idempotency_key(saga_id, "reserve", &a),
            idempotency_key(saga_id, "reserve", &b)
        );

        let nested_a = data(json!({"meta": {"request_id": "r1"}, "sku": "A"}));
        let nested_b = data(json!({"meta": {"request_id": "r2"}, "sku": "A"}));
        assert_eq!(
            idempotency_key(saga_id, "reserve", &nested_a),
            idempotency_key(saga_id, "reserve", &nested_b)
        );
    }

    #[test]
    fn test_key_varies_with_inputs() {
        let saga_id = SagaId::new();
        let d = data(json!({"order_id": "o-1"}));
        let other = data(json!({"order_id": "o-2"}));
        let base = idempotency_key(saga_id, "pay", &d);
        assert_ne!(base, idempotency_key(saga_id, "ship", &d));
        assert_ne!(base, idempotency_key(SagaId::new(), "pay", &d));
        assert_ne!(base, idempotency_key(saga_id, "pay", &other));
    }

    #[test]
    fn test_compensation_namespace() {
        assert_eq!(compensation_key("abc"), "comp:abc");
    }

    #[test]
    fn test_local_cache_evicts_oldest() {
        let cache = LocalCache::new(2);
        for key in ["a", "b", "c"] {
            cache.insert(IdempotencyRecord::new(key, SagaData::new(), Duration::from_secs(60)));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());

        assert!(cache.remove("b"));
        assert!(!cache.remove("b"));
    }

    #[test]
    fn test_local_cache_drops_expired() {
        let cache = LocalCache::new(4);
        cache.insert(IdempotencyRecord::new("k", SagaData::new(), Duration::ZERO));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
