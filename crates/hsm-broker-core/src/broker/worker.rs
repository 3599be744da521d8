//! Worker loop: one queued task, one pooled connection, one exchange.

use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, Result};
use crate::pool::PoolItem;
use crate::protocol::codec;
use crate::protocol::{CorrelationId, CORRELATION_ID_LEN};

use super::client::Shared;
use super::pending::{Registration, Task};

impl<C> Shared<C>
where
    C: PoolItem + AsyncRead + AsyncWrite + Unpin,
{
    /// Serve tasks until `stop` fires or the queue is closed.
    pub(crate) async fn run_worker(&self, stop: CancellationToken) {
        debug!("worker started");
        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => None,
                task = async { self.queue_rx.lock().await.recv().await } => task,
            };
            let Some(task) = next else {
                break;
            };
            self.process(task, &stop).await;
        }
        debug!("worker stopped");
    }

    async fn process(&self, task: Task, stop: &CancellationToken) {
        let Task {
            id,
            request,
            reply,
            enqueued_at,
        } = task;
        trace!(correlation_id = %id, queued_for = ?enqueued_at.elapsed(), "dequeued request");

        let frame = match frame_request(id, &request) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        match self.pending.register(id, reply) {
            Registration::Registered => self.update_pending_gauge(),
            Registration::CallerGone => {
                debug!(correlation_id = %id, "caller gave up before dispatch, skipping");
                return;
            }
            Registration::Duplicate(reply) => {
                warn!(correlation_id = %id, "correlation id already in flight");
                let _ = reply.send(Err(BrokerError::DuplicateCorrelationId(id.to_string())));
                return;
            }
        }

        let mut conn = match self.pool.get_with_cancel(stop).await {
            Ok(conn) => conn,
            Err(e) => {
                if matches!(e, BrokerError::Connection(_) | BrokerError::ConnectTimeout { .. }) {
                    self.record_connection_failure("acquire");
                }
                let e = match e {
                    BrokerError::Cancelled | BrokerError::PoolClosing
                        if self.closed.load(Ordering::Acquire) =>
                    {
                        BrokerError::Shutdown
                    }
                    e => e,
                };
                self.fail(&id, e);
                return;
            }
        };
        self.update_pool_gauge();

        if let Err(e) = write_all_flush(&mut conn, &frame).await {
            warn!(correlation_id = %id, error = %e, "write to device failed");
            self.record_connection_failure("write");
            self.pool.release(conn).await;
            self.update_pool_gauge();
            self.fail(&id, e);
            return;
        }

        let response = match codec::read_frame(&mut conn).await {
            Ok(response) => response,
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "read from device failed");
                self.record_connection_failure("read");
                self.pool.release(conn).await;
                self.update_pool_gauge();
                self.fail(&id, e);
                return;
            }
        };

        self.demultiplex(&id, response);
        self.pool.put(conn).await;
        self.update_pool_gauge();
    }

    /// Route a response frame to the task named by its correlation id.
    fn demultiplex(&self, current: &CorrelationId, response: Bytes) {
        let Some(response_id) = CorrelationId::from_prefix(&response) else {
            warn!(correlation_id = %current, len = response.len(), "response too short for a correlation id");
            self.fail(
                current,
                BrokerError::InvalidResponse(format!(
                    "{}-byte frame carries no correlation id",
                    response.len()
                )),
            );
            return;
        };

        let body = response.slice(CORRELATION_ID_LEN..);
        if self.pending.resolve(&response_id, Ok(body)) {
            trace!(correlation_id = %response_id, "response delivered");
        } else {
            warn!(
                correlation_id = %current,
                response_id = %response_id,
                "no pending request for response, dropping"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_unmatched_response();
            }
        }
        self.update_pending_gauge();
    }

    fn fail(&self, id: &CorrelationId, error: BrokerError) {
        if !self.pending.resolve(id, Err(error)) {
            debug!(correlation_id = %id, "request already resolved");
        }
        self.update_pending_gauge();
    }

    fn record_connection_failure(&self, stage: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_connection_failure(stage);
        }
    }
}

/// Build the wire frame `[len][id][request]`.
fn frame_request(id: CorrelationId, request: &[u8]) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(CORRELATION_ID_LEN + request.len());
    body.extend_from_slice(id.as_bytes());
    body.extend_from_slice(request);
    codec::encode(&body)
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
