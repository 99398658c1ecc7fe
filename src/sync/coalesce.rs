use std::collections::HashMap;
use std::future::Future;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

/// Merges concurrent requests for the same key into one operation.
///
/// The first caller for a key starts the work; callers arriving while it
/// is pending await the same shared future and receive a clone of its
/// output. The entry is dropped once the operation settles, so the next
/// call starts fresh.
pub struct InFlight<T: Clone> {
    pending: Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `start()` for `key` unless an operation for it is already
    /// pending, in which case that one is awaited instead.
    pub async fn run<F, Fut>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().await;
            match pending.get(key) {
                Some(existing) => {
                    tracing::debug!("🔁 Joining in-flight request for {}", key);
                    existing.clone()
                }
                None => {
                    let fut = start().boxed().shared();
                    pending.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };

        let output = shared.clone().await;

        let mut pending = self.pending.lock().await;
        if pending.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
            pending.remove(key);
        }

        output
    }

    /// Number of keys with a pending operation.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let in_flight = Arc::new(InFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                7
            }
        };

        let (a, b) = tokio::join!(
            in_flight.run("vin", make(calls.clone())),
            in_flight.run("vin", make(calls.clone())),
        );

        assert_eq!((a, b), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.len().await, 0);

        in_flight.run("vin", make(calls.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let in_flight = InFlight::<&'static str>::new();
        let (a, b) = tokio::join!(
            in_flight.run("a", || async { "A" }),
            in_flight.run("b", || async { "B" }),
        );
        assert_eq!((a, b), ("A", "B"));
    }
}
