use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::coordination::registry::{child_names, in_tree};
use crate::coordination::{LockService, Registry};
use crate::error::MigrationResult;

/// In-process registry.
///
/// Only suitable when every sharding item of a job runs in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored key, for inspection in tests.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }
}

impl Registry for MemoryRegistry {
    async fn put(&self, key: &str, value: String) -> MigrationResult<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> MigrationResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete_tree(&self, prefix: &str) -> MigrationResult<()> {
        self.entries
            .lock()
            .await
            .retain(|key, _| !in_tree(prefix, key));
        Ok(())
    }

    async fn children(&self, prefix: &str) -> MigrationResult<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(child_names(prefix, entries.keys().map(String::as_str)))
    }
}

/// In-process named locks.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockService {
    held: Arc<std::sync::Mutex<HashSet<String>>>,
    released: Arc<Notify>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|mut held| held.insert(name.to_string()))
            .unwrap_or(false)
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct MemoryLockGuard {
    name: String,
    held: Arc<std::sync::Mutex<HashSet<String>>>,
    released: Arc<Notify>,
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.name);
        }
        self.released.notify_waiters();
    }
}

impl LockService for MemoryLockService {
    type Guard = MemoryLockGuard;

    async fn try_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> MigrationResult<Option<MemoryLockGuard>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.acquire(name) {
                return Ok(Some(MemoryLockGuard {
                    name: name.to_string(),
                    held: self.held.clone(),
                    released: self.released.clone(),
                }));
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn unlock(&self, guard: MemoryLockGuard) -> MigrationResult<()> {
        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_tree_removes_only_the_subtree() {
        let registry = MemoryRegistry::new();
        registry.put("/a/b", "1".to_string()).await.unwrap();
        registry.put("/a/b/c", "2".to_string()).await.unwrap();
        registry.put("/a/bc", "3".to_string()).await.unwrap();

        registry.delete_tree("/a/b").await.unwrap();

        assert_eq!(registry.keys().await, vec!["/a/bc".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let locks = MemoryLockService::new();
        let guard = locks
            .try_lock("/pipeline/locks/j1", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let second = locks
            .try_lock("/pipeline/locks/j1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(second.is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .try_lock("/pipeline/locks/j1", Duration::from_secs(5))
                    .await
                    .unwrap()
                    .is_some()
            })
        };
        locks.unlock(guard).await.unwrap();

        assert!(waiter.await.unwrap());
        assert!(!locks.is_locked("/pipeline/locks/j1"));
    }
}
