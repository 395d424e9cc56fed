use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per thread id; at most one turn of a thread runs at a time.
#[derive(Default)]
pub struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the thread is free. The lock is released when the guard drops.
    pub async fn acquire(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.locks.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Entries nobody holds or waits on can go.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(thread_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn active(&self) -> usize {
        self.locks.lock().map(|map| map.len()).unwrap_or_default()
    }
}
