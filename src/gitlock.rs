//! Per-project git serialization. Modeled as a single-slot FIFO: one
//! `tokio::sync::Mutex<()>` guard held across an entire checkout/merge
//! sequence, giving the same strict ordering as the source's tail-chained
//! futures with much simpler code (see DESIGN.md).

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct GitLock {
    inner: Arc<Mutex<()>>,
}

impl GitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for the duration of the returned guard. Git
    /// operations on the same project never overlap while any guard is held.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_concurrent_acquisitions() {
        let lock = GitLock::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let lock = lock.clone();
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                let after = counter.load(Ordering::SeqCst);
                // No other task incremented the counter while we held the lock.
                assert_eq!(before + 1, after);
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
