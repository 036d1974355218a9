//! Generic async resource pool
//!
//! Used for pooled connections and sandbox processes. Resources are created
//! by a factory, optionally validated before hand-out, and destroyed when
//! invalid or when the pool shuts down. Waiters queue on a semaphore.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

/// Factory and lifecycle hooks for pooled resources.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Create a fresh resource.
    async fn create(&self) -> anyhow::Result<Self::Resource>;

    /// Whether a pooled resource is still usable. Invalid resources are
    /// destroyed instead of handed out.
    async fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Tear a resource down.
    async fn destroy(&self, _resource: Self::Resource) {}
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live resources (held + idle).
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_size: 8 }
    }
}

/// A bounded resource pool with a waiter queue.
pub struct ResourcePool<F: ResourceFactory> {
    factory: F,
    idle: Mutex<VecDeque<F::Resource>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

/// A resource checked out of the pool. Return it with
/// [`ResourcePool::release`] or drop it permanently with
/// [`ResourcePool::destroy`].
pub struct PooledResource<R> {
    pub resource: R,
    permit: tokio::sync::OwnedSemaphorePermit,
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size.max(1)));
        Self {
            factory,
            idle: Mutex::new(VecDeque::new()),
            permits,
            config,
        }
    }

    /// Check a resource out, waiting for capacity if the pool is exhausted.
    pub async fn acquire(&self) -> anyhow::Result<PooledResource<F::Resource>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");

        // Reuse an idle resource if it still validates.
        loop {
            let candidate = self.idle.lock().pop_front();
            match candidate {
                Some(resource) => {
                    if self.factory.validate(&resource).await {
                        return Ok(PooledResource { resource, permit });
                    }
                    debug!("discarding invalid pooled resource");
                    self.factory.destroy(resource).await;
                }
                None => break,
            }
        }

        let resource = self.factory.create().await?;
        Ok(PooledResource { resource, permit })
    }

    /// Return a resource to the idle set.
    pub fn release(&self, pooled: PooledResource<F::Resource>) {
        self.idle.lock().push_back(pooled.resource);
        drop(pooled.permit);
    }

    /// Destroy a resource instead of returning it.
    pub async fn destroy(&self, pooled: PooledResource<F::Resource>) {
        self.factory.destroy(pooled.resource).await;
        drop(pooled.permit);
    }

    /// Number of idle resources currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of resources currently checked out.
    pub fn in_use(&self) -> usize {
        self.config.max_size - self.permits.available_permits()
    }

    /// Destroy every idle resource.
    pub async fn drain(&self) {
        loop {
            let resource = self.idle.lock().pop_front();
            match resource {
                Some(r) => self.factory.destroy(r).await,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        valid: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ResourceFactory for Arc<Counter> {
        type Resource = usize;

        async fn create(&self) -> anyhow::Result<usize> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _resource: &usize) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _resource: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            valid: std::sync::atomic::AtomicBool::new(true),
        })
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_resource() {
        let factory = counter();
        let pool = ResourcePool::new(factory.clone(), PoolConfig { max_size: 2 });

        let a = pool.acquire().await.unwrap();
        pool.release(a);
        let b = pool.acquire().await.unwrap();
        assert_eq!(b.resource, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_resources_are_destroyed() {
        let factory = counter();
        let pool = ResourcePool::new(factory.clone(), PoolConfig { max_size: 2 });

        let a = pool.acquire().await.unwrap();
        pool.release(a);
        factory.valid.store(false, Ordering::SeqCst);

        // The idle resource fails validation; a new one is created.
        let b = pool.acquire().await.unwrap();
        assert_eq!(b.resource, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_block_until_release() {
        let factory = counter();
        let pool = Arc::new(ResourcePool::new(factory, PoolConfig { max_size: 1 }));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.unwrap().resource })
        };

        // The waiter cannot complete while the only slot is held.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pool.release(held);
        let reused = waiter.await.unwrap();
        assert_eq!(reused, 0);
    }

    #[tokio::test]
    async fn test_drain_destroys_idle() {
        let factory = counter();
        let pool = ResourcePool::new(factory.clone(), PoolConfig { max_size: 2 });

        let a = pool.acquire().await.unwrap();
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);

        pool.drain().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }
}
