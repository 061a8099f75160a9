//! Latest-outcome store shared between scheduler loops and readers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::models::*;

#[derive(Default)]
struct Inner {
    /// Configured targets in insertion order.
    targets: Vec<Arc<Target>>,
    latest: HashMap<String, Arc<Outcome>>,
}

/// Thread-safe map from target identity to its latest outcome.
///
/// Each entry is replaced wholesale under the write lock, so a snapshot never
/// observes a partially written outcome. Snapshots copy `Arc`s only.
#[derive(Default)]
pub struct ResultStore {
    inner: RwLock<Inner>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a target to the configured set. It reads as pending until the
    /// first `put`. Returns false if the identity is already registered.
    pub fn register(&self, target: Arc<Target>) -> bool {
        let mut inner = self.write();
        if inner.targets.iter().any(|t| t.identity == target.identity) {
            return false;
        }
        inner.targets.push(target);
        true
    }

    /// Replace the latest outcome for `identity`.
    ///
    /// Writes for identities that are not registered (or were removed) are
    /// dropped, and false is returned.
    pub fn put(&self, identity: &str, outcome: Outcome) -> bool {
        let mut inner = self.write();
        if !inner.targets.iter().any(|t| t.identity == identity) {
            return false;
        }
        inner.latest.insert(identity.to_string(), Arc::new(outcome));
        true
    }

    /// Forget a target and its latest outcome.
    pub fn remove(&self, identity: &str) -> bool {
        let mut inner = self.write();
        let before = inner.targets.len();
        inner.targets.retain(|t| t.identity != identity);
        inner.latest.remove(identity);
        inner.targets.len() != before
    }

    /// Status of a single target, or `None` if it is not configured.
    pub fn get(&self, identity: &str) -> Option<Status> {
        let inner = self.read();
        inner.targets.iter().find(|t| t.identity == identity)?;
        Some(match inner.latest.get(identity) {
            Some(outcome) => Status::from_outcome(outcome.clone()),
            None => Status::Pending,
        })
    }

    /// Point-in-time view of every configured target, in configuration order.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let inner = self.read();
        inner
            .targets
            .iter()
            .map(|target| SnapshotEntry {
                target: target.clone(),
                status: match inner.latest.get(&target.identity) {
                    Some(outcome) => Status::from_outcome(outcome.clone()),
                    None => Status::Pending,
                },
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
