//! Collapsing concurrent identical requests into one.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Runs at most one future per key at a time.
///
/// Callers arriving while a future for their key is in flight wait for that
/// future and receive a clone of its output instead of starting their own.
pub struct Flight<K, V: Clone> {
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Flight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Flight {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the output of the in-flight future for `key`, or of `fut`
    /// if there is none.
    pub async fn run<F>(&self, key: K, fut: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inflight
                .entry(key.clone())
                .or_insert_with(|| fut.boxed().shared())
                .clone()
        };

        let res = shared.clone().await;

        let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&shared)) {
            inflight.remove(&key);
        }
        res
    }

    /// The number of keys with a future in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().map(|inflight| inflight.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Flight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Clone> std::fmt::Debug for Flight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Flight")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_calls_share_one_future() {
        let flight = Arc::new(Flight::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("k".to_string(), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        7
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn later_calls_start_a_new_flight() {
        let flight = Flight::<u8, u8>::new();
        assert_eq!(flight.run(1, async { 1 }).await, 1);
        assert_eq!(flight.run(1, async { 2 }).await, 2);
    }
}
