//! Bounded pool of reusable device connections.
//!
//! Resources are created lazily through a caller-supplied factory, up to a
//! fixed capacity, and handed out in FIFO order once returned.

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};

use super::item::{boxed_factory, Factory, PoolItem};

struct PoolState<T> {
    /// Created and not yet destroyed, idle or checked out.
    count: usize,
    idle: VecDeque<T>,
    closed: bool,
}

/// Bounded connection pool.
///
/// The semaphore holds one permit per slot a caller may take right now: every
/// idle resource plus every slot that has not been created yet. Acquiring a
/// permit therefore either finds an idle resource or guarantees there is room
/// to create one, so the pool never exceeds its capacity.
pub struct ConnectionPool<T> {
    capacity: usize,
    state: Mutex<PoolState<T>>,
    available: Semaphore,
    factory: Factory<T>,
}

/// A counted slot whose resource is still being created.
struct Reservation<'a, T> {
    pool: &'a ConnectionPool<T>,
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.state.lock();
            state.count = state.count.saturating_sub(1);
        }
        self.pool.available.add_permits(1);
    }
}

impl<T: PoolItem> ConnectionPool<T> {
    /// Create a pool of at most `capacity` resources built by `factory`.
    ///
    /// No resource is created until the first [`get`](Self::get).
    pub fn new<F, Fut>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                count: 0,
                idle: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Semaphore::new(capacity),
            factory: boxed_factory(factory),
        }
    }

    /// Acquire a resource, waiting for one to be returned if the pool is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PoolClosing`] if the pool is or becomes closed,
    /// or the factory's error if creating a resource fails.
    pub async fn get(&self) -> Result<T> {
        if self.is_closed() {
            return Err(BrokerError::PoolClosing);
        }
        let permit = self.available.acquire().await;
        self.checkout(permit).await
    }

    /// Like [`get`](Self::get), but gives up with [`BrokerError::Cancelled`]
    /// when `cancel` fires while waiting.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn get_with_cancel(&self, cancel: &CancellationToken) -> Result<T> {
        if self.is_closed() {
            return Err(BrokerError::PoolClosing);
        }
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BrokerError::Cancelled),
            permit = self.available.acquire() => permit,
        };
        self.checkout(permit).await
    }

    /// Turn an acquired slot into a resource.
    async fn checkout(
        &self,
        permit: std::result::Result<SemaphorePermit<'_>, AcquireError>,
    ) -> Result<T> {
        let Ok(permit) = permit else {
            return Err(BrokerError::PoolClosing);
        };
        // The slot now belongs to the caller until put or release hands it back.
        permit.forget();

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BrokerError::PoolClosing);
            }
            if let Some(item) = state.idle.pop_front() {
                return Ok(item);
            }
            state.count += 1;
        }

        // Gives the slot back if the factory fails or this future is dropped.
        let reservation = Reservation { pool: self };
        match (self.factory)().await {
            Ok(item) => {
                std::mem::forget(reservation);
                debug!(count = self.len(), capacity = self.capacity, "created pooled connection");
                Ok(item)
            }
            Err(e) => {
                drop(reservation);
                warn!(error = %e, "failed to create pooled connection");
                Err(e)
            }
        }
    }

    /// Return a healthy resource for reuse.
    ///
    /// Once the pool is closed the resource is destroyed instead.
    pub async fn put(&self, item: T) {
        let item = {
            let mut state = self.state.lock();
            if !state.closed {
                state.idle.push_back(item);
                self.available.add_permits(1);
                return;
            }
            state.count = state.count.saturating_sub(1);
            item
        };

        if let Err(e) = item.close().await {
            debug!(error = %e, "error closing connection returned after shutdown");
        }
    }

    /// Destroy a resource known to be unhealthy and free its slot.
    pub async fn release(&self, item: T) {
        {
            let mut state = self.state.lock();
            state.count = state.count.saturating_sub(1);
        }
        self.available.add_permits(1);

        if let Err(e) = item.close().await {
            debug!(error = %e, "error closing released connection");
        }
        debug!(count = self.len(), "released pooled connection");
    }

    /// Close the pool.
    ///
    /// Waiters are woken with [`BrokerError::PoolClosing`] and idle resources
    /// are destroyed. Resources still checked out are destroyed when they
    /// come back through [`put`](Self::put) or [`release`](Self::release).
    pub async fn close(&self) {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<T> = state.idle.drain(..).collect();
            state.count -= drained.len();
            drained
        };
        self.available.close();

        info!(closed_idle = drained.len(), "closing connection pool");
        for item in drained {
            if let Err(e) = item.close().await {
                debug!(error = %e, "error closing idle connection");
            }
        }
    }

    /// Number of resources created and not yet destroyed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    /// Check if the pool currently holds no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resources waiting in the idle queue.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Configured maximum number of resources.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Test resource that counts how many of its kind are alive.
    #[derive(Debug)]
    struct Counted {
        id: usize,
        live: Arc<AtomicUsize>,
    }

    impl PoolItem for Counted {
        fn close(self) -> impl Future<Output = Result<()>> + Send {
            self.live.fetch_sub(1, Ordering::SeqCst);
            async { Ok(()) }
        }
    }

    fn counting_pool(capacity: usize) -> (ConnectionPool<Counted>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let pool = {
            let live = Arc::clone(&live);
            let created = Arc::clone(&created);
            ConnectionPool::new(capacity, move || {
                let live = Arc::clone(&live);
                let id = created.fetch_add(1, Ordering::SeqCst);
                async move {
                    live.fetch_add(1, Ordering::SeqCst);
                    Ok(Counted { id, live })
                }
            })
        };
        (pool, live, created)
    }

    #[tokio::test]
    async fn test_pool_creates_lazily() {
        let (pool, _live, created) = counting_pool(2);
        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());

        let item = pool.get().await.unwrap();
        assert_eq!(item.id, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_pool_reuse() {
        let (pool, _live, created) = counting_pool(2);

        let item = pool.get().await.unwrap();
        let id1 = item.id;
        pool.put(item).await;
        assert_eq!(pool.idle_len(), 1);

        let item = pool.get().await.unwrap();
        assert_eq!(item.id, id1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_blocks_at_capacity() {
        let (pool, _live, created) = counting_pool(2);
        let pool = Arc::new(pool);

        let a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let returned_id = a.id;
        pool.put(a).await;

        let c = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(c.id, returned_id);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_frees_slot_for_new_resource() {
        let (pool, live, created) = counting_pool(1);

        let item = pool.get().await.unwrap();
        pool.release(item).await;
        assert_eq!(pool.len(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let item = pool.get().await.unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_error_returned_and_slot_restored() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let pool = {
            let attempts = Arc::clone(&attempts);
            ConnectionPool::new(1, move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(BrokerError::Connection(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "refused",
                        )))
                    } else {
                        Ok(Counted {
                            id: attempt,
                            live: Arc::new(AtomicUsize::new(1)),
                        })
                    }
                }
            })
        };

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(ref e) if e.kind() == std::io::ErrorKind::ConnectionRefused));
        assert_eq!(pool.len(), 0);

        // The failed attempt must not have consumed the only slot.
        let conn = tokio::time::timeout(Duration::from_secs(1), pool.get()).await;
        assert!(conn.unwrap().is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_get_during_create_restores_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));
        let pool = {
            let attempts = Arc::clone(&attempts);
            let live = Arc::clone(&live);
            ConnectionPool::new(1, move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let live = Arc::clone(&live);
                async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    live.fetch_add(1, Ordering::SeqCst);
                    Ok(Counted { id: attempt, live })
                }
            })
        };

        let abandoned = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.len(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let item = tokio::time::timeout(Duration::from_millis(500), pool.get())
            .await
            .expect("slot was not returned")
            .unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_get_with_cancel() {
        let (pool, _live, _created) = counting_pool(1);
        let _held = pool.get().await.unwrap();

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let result = pool.get_with_cancel(&token).await;
        assert!(matches!(result, Err(BrokerError::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_destroys_idle_and_rejects_get() {
        let (pool, live, _created) = counting_pool(2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a).await;
        assert_eq!(live.load(Ordering::SeqCst), 2);

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);

        assert!(matches!(pool.get().await, Err(BrokerError::PoolClosing)));
        let token = CancellationToken::new();
        assert!(matches!(
            pool.get_with_cancel(&token).await,
            Err(BrokerError::PoolClosing)
        ));

        // Returned after close: destroyed, not re-queued.
        pool.put(b).await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (pool, _live, _created) = counting_pool(1);
        let pool = Arc::new(pool);
        let _held = pool.get().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BrokerError::PoolClosing)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_never_exceed_capacity() {
        let (pool, live, created) = counting_pool(3);
        let pool = Arc::new(pool);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let item = pool.get().await.unwrap();
                    peak.fetch_max(live.load(Ordering::SeqCst), Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    pool.put(item).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(created.load(Ordering::SeqCst) <= 3);
        assert!(pool.len() <= 3);
    }
}
