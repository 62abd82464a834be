//! Value Store - the deduplicating set of broadcast values a node has seen.
//!
//! Grows monotonically; nothing is ever removed. `try_add` reports whether a
//! value was newly learned, which is what callers use to decide whether to
//! propagate it further.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;

/// Largest magnitude at which every integer is exactly representable as f64.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A broadcast value: any JSON number, compared with float semantics.
///
/// `10` and `10.0` are the same value. Integral values are written back as
/// JSON integers so clients see what they sent.
#[derive(Clone, Copy)]
pub struct Value(f64);

impl Value {
    /// Wrap a number. `-0.0` is folded into `0.0`.
    pub fn new(value: f64) -> Self {
        if value == 0.0 {
            Self(0.0)
        } else {
            Self(value)
        }
    }

    /// The underlying number.
    pub fn get(self) -> f64 {
        self.0
    }

    fn as_integer(self) -> Option<i64> {
        let v = self.0;
        (v.is_finite() && v.fract() == 0.0 && v.abs() <= MAX_EXACT_INTEGER).then_some(v as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::new(value as f64)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_integer() {
            Some(i) => write!(f, "{}", i),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_integer() {
            Some(i) => serializer.serialize_i64(i),
            None => serializer.serialize_f64(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Value::new)
    }
}

/// Thread-safe set of every value this node knows about.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: Mutex<BTreeSet<Value>>,
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` if absent. Returns `true` only when it was newly learned.
    pub async fn try_add(&self, value: Value) -> bool {
        self.values.lock().await.insert(value)
    }

    /// Insert every value, returning how many were new.
    pub async fn merge<I>(&self, values: I) -> usize
    where
        I: IntoIterator<Item = Value>,
    {
        let mut set = self.values.lock().await;
        values.into_iter().filter(|v| set.insert(*v)).count()
    }

    /// An independent copy of the current contents.
    pub async fn snapshot(&self) -> BTreeSet<Value> {
        self.values.lock().await.clone()
    }

    /// Whether `value` has been seen.
    pub async fn contains(&self, value: Value) -> bool {
        self.values.lock().await.contains(&value)
    }

    /// Number of distinct values seen.
    pub async fn len(&self) -> usize {
        self.values.lock().await.len()
    }

    /// Whether nothing has been seen yet.
    pub async fn is_empty(&self) -> bool {
        self.values.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_value_float_semantics() {
        assert_eq!(Value::from(10_i64), Value::from(10.0));
        assert_eq!(Value::new(-0.0), Value::new(0.0));
        assert!(Value::new(1.5) < Value::new(2.0));

        let parsed: Value = serde_json::from_str("10.0").unwrap();
        assert_eq!(parsed, Value::from(10_i64));
    }

    #[test]
    fn test_value_serialization() {
        assert_eq!(serde_json::to_string(&Value::new(10.0)).unwrap(), "10");
        assert_eq!(serde_json::to_string(&Value::new(-3.0)).unwrap(), "-3");
        assert_eq!(serde_json::to_string(&Value::new(2.5)).unwrap(), "2.5");

        let values: Vec<Value> = serde_json::from_str("[1, 2.5, -7]").unwrap();
        assert_eq!(serde_json::to_string(&values).unwrap(), "[1,2.5,-7]");
        assert!(serde_json::from_str::<Value>("\"ten\"").is_err());
    }

    #[tokio::test]
    async fn test_try_add_reports_new_knowledge() {
        let store = ValueStore::new();
        assert!(store.is_empty().await);

        assert!(store.try_add(Value::from(10_i64)).await);
        assert!(!store.try_add(Value::from(10_i64)).await);
        assert!(!store.try_add(Value::new(10.0)).await);
        assert!(store.try_add(Value::from(11_i64)).await);

        assert_eq!(store.len().await, 2);
        assert!(store.contains(Value::from(11_i64)).await);
    }

    #[tokio::test]
    async fn test_merge_counts_new_values() {
        let store = ValueStore::new();
        store.try_add(Value::from(1_i64)).await;

        let added = store
            .merge([1_i64, 2, 3, 3].into_iter().map(Value::from))
            .await;
        assert_eq!(added, 2);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_snapshot_is_independent() {
        let store = ValueStore::new();
        store.try_add(Value::from(1_i64)).await;

        let snapshot = store.snapshot().await;
        store.try_add(Value::from(2_i64)).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_inserts() {
        let store = Arc::new(ValueStore::new());
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..32 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let mut newly_added = 0;
                for v in 0..50_i64 {
                    if store.try_add(Value::from(v)).await {
                        newly_added += 1;
                    }
                }
                newly_added
            });
        }

        let mut total = 0;
        while let Some(count) = tasks.join_next().await {
            total += count.unwrap();
        }

        // Each value was reported as new exactly once across all tasks.
        assert_eq!(total, 50);
        assert_eq!(store.len().await, 50);
    }

    proptest! {
        #[test]
        fn prop_try_add_true_exactly_once(values in prop::collection::vec(-1000i64..1000, 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = ValueStore::new();
                let mut seen = std::collections::HashSet::new();
                for v in &values {
                    let added = store.try_add(Value::from(*v)).await;
                    assert_eq!(added, seen.insert(*v));
                }
                assert_eq!(store.len().await, seen.len());
            });
        }

        #[test]
        fn prop_value_json_round_trip(whole in -1_000_000i64..1_000_000, quarters in 0u8..4) {
            let value = Value::new(whole as f64 + f64::from(quarters) * 0.25);
            let encoded = serde_json::to_string(&value).unwrap();
            let decoded: Value = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
