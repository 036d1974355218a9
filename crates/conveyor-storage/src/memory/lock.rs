//! In-memory lock store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conveyor_core::status::LockType;

use crate::error::StoreError;
use crate::models::{LockRow, LockStats};
use crate::store::LockStore;

use super::InMemoryState;

/// In-memory implementation of [`LockStore`].
#[derive(Clone)]
pub struct InMemoryLockStore {
    state: Arc<InMemoryState>,
}

impl InMemoryLockStore {
    pub fn new(state: Arc<InMemoryState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        lock_type: LockType,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut locks = self.state.locks.write();

        match locks.get_mut(key) {
            Some(existing) if existing.expires_at > now => Ok(false),
            Some(existing) => {
                // Expired: take over in place.
                existing.owner = owner.to_string();
                existing.lock_type = lock_type.to_string();
                existing.expires_at = expires_at;
                existing.lock_data = lock_data;
                existing.updated_at = now;
                Ok(true)
            }
            None => {
                locks.insert(
                    key.to_string(),
                    LockRow {
                        lock_key: key.to_string(),
                        owner: owner.to_string(),
                        lock_type: lock_type.to_string(),
                        expires_at,
                        lock_data,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError> {
        let mut locks = self.state.locks.write();
        match owner {
            Some(owner) => {
                if locks.get(key).is_some_and(|l| l.owner == owner) {
                    locks.remove(key);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(locks.remove(key).is_some()),
        }
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        new_expires_at: DateTime<Utc>,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.state.locks.write();

        match locks.get_mut(key) {
            Some(lock) if lock.owner == owner && lock.expires_at > now => {
                lock.expires_at = new_expires_at;
                if let Some(data) = lock_data {
                    lock.lock_data = Some(data);
                }
                lock.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut locks = self.state.locks.write();
        let before = locks.len();
        locks.retain(|_, l| l.expires_at >= now);
        Ok((before - locks.len()) as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<LockRow>, StoreError> {
        Ok(self.state.locks.read().get(key).cloned())
    }

    async fn find_by_owner(&self, owner: &str) -> Result<Vec<LockRow>, StoreError> {
        let mut rows: Vec<LockRow> = self
            .state
            .locks
            .read()
            .values()
            .filter(|l| l.owner == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.lock_key.cmp(&b.lock_key));
        Ok(rows)
    }

    async fn find_by_lock_type(&self, lock_type: LockType) -> Result<Vec<LockRow>, StoreError> {
        let wanted = lock_type.to_string();
        let mut rows: Vec<LockRow> = self
            .state
            .locks
            .read()
            .values()
            .filter(|l| l.lock_type == wanted)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.lock_key.cmp(&b.lock_key));
        Ok(rows)
    }

    async fn statistics(&self) -> Result<LockStats, StoreError> {
        let now = Utc::now();
        let locks = self.state.locks.read();

        let mut stats = LockStats::default();
        for lock in locks.values() {
            stats.total += 1;
            if lock.expires_at < now {
                stats.expired += 1;
            }
            *stats.by_type.entry(lock.lock_type.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryLockStore {
        InMemoryLockStore::new(InMemoryState::new())
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let locks = store();
        let ttl = Duration::from_secs(30);

        assert!(locks
            .acquire("workflow:1", "a", ttl, LockType::Workflow, None)
            .await
            .unwrap());
        assert!(!locks
            .acquire("workflow:1", "b", ttl, LockType::Workflow, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let locks = store();

        assert!(locks
            .acquire("k", "a", Duration::ZERO, LockType::Resource, None)
            .await
            .unwrap());
        // TTL zero: already expired, B takes over.
        assert!(locks
            .acquire("k", "b", Duration::from_secs(30), LockType::Resource, None)
            .await
            .unwrap());
        let row = locks.get("k").await.unwrap().unwrap();
        assert_eq!(row.owner, "b");
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let locks = store();
        let ttl = Duration::from_secs(30);

        locks
            .acquire("k", "a", ttl, LockType::Resource, None)
            .await
            .unwrap();
        assert!(!locks.release("k", Some("b")).await.unwrap());
        assert!(locks.release("k", Some("a")).await.unwrap());
        // Released: anyone can acquire again.
        assert!(locks
            .acquire("k", "b", ttl, LockType::Resource, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let locks = store();
        locks
            .acquire("k", "a", Duration::from_secs(30), LockType::Resource, None)
            .await
            .unwrap();
        assert!(locks.release("k", None).await.unwrap());
        assert!(locks.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_requires_live_ownership() {
        let locks = store();
        let later = Utc::now() + chrono::Duration::seconds(120);

        locks
            .acquire("k", "a", Duration::from_secs(30), LockType::Resource, None)
            .await
            .unwrap();
        assert!(locks.renew("k", "a", later, None).await.unwrap());
        assert!(!locks.renew("k", "b", later, None).await.unwrap());
        assert!(!locks.renew("missing", "a", later, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let locks = store();
        locks
            .acquire("dead", "a", Duration::ZERO, LockType::Resource, None)
            .await
            .unwrap();
        locks
            .acquire("live", "a", Duration::from_secs(60), LockType::Resource, None)
            .await
            .unwrap();

        let removed = locks.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(locks.get("dead").await.unwrap().is_none());
        assert!(locks.get("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_statistics_by_type() {
        let locks = store();
        let ttl = Duration::from_secs(30);
        locks
            .acquire("w:1", "a", ttl, LockType::Workflow, None)
            .await
            .unwrap();
        locks
            .acquire("w:2", "a", ttl, LockType::Workflow, None)
            .await
            .unwrap();
        locks
            .acquire("n:1", "b", ttl, LockType::Node, None)
            .await
            .unwrap();

        let stats = locks.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type.get("workflow"), Some(&2));
        assert_eq!(stats.by_type.get("node"), Some(&1));
    }
}
