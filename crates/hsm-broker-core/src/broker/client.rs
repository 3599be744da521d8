//! The request/response broker.
//!
//! [`Broker::send`] is the only entry point callers need. Requests are queued
//! for a fixed set of workers, each of which borrows a pooled connection for
//! exactly one request/response exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::metrics::BrokerMetrics;
use crate::pool::{ConnectionPool, PoolItem};
use crate::protocol::CorrelationIdGenerator;

use super::pending::{PendingTable, Task};

/// Default deadline for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 2;

/// State shared between the broker handle and its workers.
pub(crate) struct Shared<C> {
    pub(crate) pool: Arc<ConnectionPool<C>>,
    pub(crate) pending: PendingTable,
    pub(crate) ids: CorrelationIdGenerator,
    pub(crate) queue_tx: Mutex<Option<mpsc::Sender<Task>>>,
    pub(crate) queue_rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    pub(crate) workers: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) metrics: Option<Arc<BrokerMetrics>>,
    pub(crate) span: Span,
    pub(crate) shutdown: CancellationToken,
    pub(crate) closed: AtomicBool,
}

impl<C> Shared<C> {
    pub(crate) fn update_pending_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending(self.pending.len());
        }
    }

    pub(crate) fn update_pool_gauge(&self)
    where
        C: PoolItem,
    {
        if let Some(metrics) = &self.metrics {
            metrics.set_pool_connections(self.pool.len());
        }
    }
}

/// Correlating request/response broker over a pool of device connections.
///
/// Cloning is cheap; all clones share the same queue, pending table and pool.
pub struct Broker<C> {
    pub(super) shared: Arc<Shared<C>>,
}

impl<C> Clone for Broker<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> std::fmt::Debug for Broker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("workers", &self.shared.workers)
            .field("request_timeout", &self.shared.request_timeout)
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder<C> {
    pool: Arc<ConnectionPool<C>>,
    workers: usize,
    request_timeout: Duration,
    metrics: Option<Arc<BrokerMetrics>>,
    span: Option<Span>,
}

impl<C> BrokerBuilder<C>
where
    C: PoolItem + AsyncRead + AsyncWrite + Unpin,
{
    /// Number of worker tasks. Values below 1 are raised to 1.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Deadline for each request, measured from the call to `send`.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Record metrics into `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parent span for every event the broker and its workers emit.
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Take workers and request timeout from a loaded configuration.
    #[must_use]
    pub fn config(self, config: &BrokerConfig) -> Self {
        self.workers(config.workers)
            .request_timeout(config.request_timeout())
    }

    /// Build the broker. Workers do not run until [`Broker::start`] is called.
    #[must_use]
    pub fn build(self) -> Broker<C> {
        let (queue_tx, queue_rx) = mpsc::channel(self.workers);
        let span = self
            .span
            .unwrap_or_else(|| info_span!("hsm_broker"));

        Broker {
            shared: Arc::new(Shared {
                pool: self.pool,
                pending: PendingTable::new(),
                ids: CorrelationIdGenerator::new(),
                queue_tx: Mutex::new(Some(queue_tx)),
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                workers: self.workers,
                request_timeout: self.request_timeout,
                metrics: self.metrics,
                span,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<C> Broker<C>
where
    C: PoolItem + AsyncRead + AsyncWrite + Unpin,
{
    /// Start building a broker over `pool`.
    pub fn builder(pool: Arc<ConnectionPool<C>>) -> BrokerBuilder<C> {
        BrokerBuilder {
            pool,
            workers: DEFAULT_WORKERS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics: None,
            span: None,
        }
    }

    /// Send one request and wait for its response.
    ///
    /// The response is the device's frame body with the correlation id
    /// stripped.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] if no outcome arrives before the
    /// request deadline, [`BrokerError::Shutdown`] once the broker is closed,
    /// or whatever error the worker hit while serving the request.
    pub async fn send(&self, request: impl Into<Bytes>) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.dispatch(request.into(), started).await;

        if let Some(metrics) = &self.shared.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            metrics.record_request(outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    async fn dispatch(&self, request: Bytes, started: Instant) -> Result<Bytes> {
        let queue = self
            .shared
            .queue_tx
            .lock()
            .clone()
            .ok_or(BrokerError::Shutdown)?;

        let deadline = started + self.shared.request_timeout;
        let id = self.shared.ids.next_id();
        let (reply, mut response) = oneshot::channel();
        let task = Task {
            id,
            request,
            reply,
            enqueued_at: started,
        };

        match timeout_at(deadline, queue.send(task)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(BrokerError::Shutdown),
            Err(_) => {
                debug!(parent: &self.shared.span, correlation_id = %id, "timed out waiting for a free worker");
                return Err(BrokerError::Timeout);
            }
        }
        drop(queue);

        match timeout_at(deadline, &mut response).await {
            Ok(Ok(result)) => result,
            // The task was dropped unresolved, which only happens during shutdown.
            Ok(Err(_)) => Err(BrokerError::Shutdown),
            Err(_) => {
                // Close the channel first so a worker that has not registered
                // the task yet skips it.
                drop(response);
                self.shared.pending.remove(&id);
                self.shared.update_pending_gauge();
                debug!(parent: &self.shared.span, correlation_id = %id, "request timed out");
                Err(BrokerError::Timeout)
            }
        }
    }

    /// Run the workers until `token` is cancelled or the broker is closed.
    ///
    /// Returns once every worker has stopped.
    pub async fn start(&self, token: CancellationToken) {
        let stop = self.shared.shutdown.child_token();
        let forward = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => stop.cancel(),
                    () = stop.cancelled() => {}
                }
            })
        };

        info!(parent: &self.shared.span, workers = self.shared.workers, "starting broker workers");

        let mut workers = JoinSet::new();
        for worker_id in 0..self.shared.workers {
            let shared = Arc::clone(&self.shared);
            let stop = stop.clone();
            let span = info_span!(parent: &self.shared.span, "worker", worker_id);
            workers.spawn(async move { shared.run_worker(stop).await }.instrument(span));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(parent: &self.shared.span, error = %e, "broker worker panicked");
                } else {
                    warn!(parent: &self.shared.span, error = %e, "broker worker aborted");
                }
            }
        }

        stop.cancel();
        let _ = forward.await;
        info!(parent: &self.shared.span, "broker workers stopped");
    }

    /// Shut the broker down.
    ///
    /// New and queued requests fail with [`BrokerError::Shutdown`], as do
    /// requests already waiting on the device. The pool is closed. Calling
    /// this more than once has no further effect.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: &self.shared.span, "closing broker");

        drop(self.shared.queue_tx.lock().take());
        self.shared.shutdown.cancel();

        let failed = self.shared.pending.fail_all(|| BrokerError::Shutdown);
        self.shared.update_pending_gauge();

        self.shared.pool.close().await;
        self.shared.update_pool_gauge();

        let mut queued = 0usize;
        {
            let mut queue = self.shared.queue_rx.lock().await;
            queue.close();
            while let Ok(task) = queue.try_recv() {
                let _ = task.reply.send(Err(BrokerError::Shutdown));
                queued += 1;
            }
        }

        info!(parent: &self.shared.span, failed_pending = failed, failed_queued = queued, "broker closed");
    }

    /// Number of requests registered with a worker and awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// The connection pool the broker draws from.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.shared.pool
    }

    /// Check if [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}
