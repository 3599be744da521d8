//! Mock device for integration testing.
//!
//! A lightweight TCP server that:
//! - Speaks the 2-byte length-prefixed framing
//! - Records every request it receives
//! - Answers through a configurable responder, or not at all

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_util::codec::Framed;

use crate::protocol::{CorrelationId, FrameCodec, CORRELATION_ID_LEN};

/// A recorded device call.
#[derive(Debug, Clone)]
pub struct DeviceCall {
    /// Index of the accepted connection the call arrived on, starting at 0.
    pub connection: usize,
    /// The correlation id at the head of the frame.
    pub correlation_id: CorrelationId,
    /// The frame body after the correlation id.
    pub command: Bytes,
}

impl DeviceCall {
    /// The 2-character command code, if present.
    #[must_use]
    pub fn command_code(&self) -> Option<&str> {
        self.command
            .get(..2)
            .and_then(|code| std::str::from_utf8(code).ok())
    }
}

/// What the mock device does with a call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with this body behind the call's correlation id.
    Body(Bytes),
    /// Answer with exactly this frame body, correlation id included.
    Raw(Bytes),
    /// Do not answer.
    Silent,
    /// Drop the connection without answering.
    Disconnect,
}

/// Responder function type.
pub type Responder = Arc<dyn Fn(&DeviceCall) -> Reply + Send + Sync>;

struct DeviceState {
    call_log: RwLock<Vec<DeviceCall>>,
    responder: RwLock<Responder>,
    silent: AtomicBool,
    delay_ms: AtomicU64,
    connections: AtomicUsize,
}

/// Mock device for testing.
pub struct MockDevice {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    state: Arc<DeviceState>,
}

impl MockDevice {
    /// Create a new mock device that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            state: Arc::new(DeviceState {
                call_log: RwLock::new(Vec::new()),
                responder: RwLock::new(responses::acknowledge()),
                silent: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Start the mock device.
    ///
    /// Returns the actual address the device is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address.clone_from(&actual_address);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let state = Arc::clone(&self.state);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _addr)) = result else { break };
                        let connection = state.connections.fetch_add(1, Ordering::SeqCst);
                        let state = Arc::clone(&state);
                        let shutdown_rx = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            Self::handle_connection(stream, connection, state, shutdown_rx).await;
                        });
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop accepting connections and close the open ones.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Replace the responder.
    pub async fn set_responder(&self, responder: Responder) {
        *self.state.responder.write().await = responder;
    }

    /// Stop answering (requests are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Wait this long before each answer.
    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<DeviceCall> {
        self.state.call_log.read().await.clone()
    }

    /// Get calls filtered by command code.
    pub async fn get_calls_for_command(&self, code: &str) -> Vec<DeviceCall> {
        self.state
            .call_log
            .read()
            .await
            .iter()
            .filter(|c| c.command_code() == Some(code))
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.state.call_log.write().await.clear();
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Get the device address. After [`start`](Self::start) this is the
    /// bound address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn handle_connection(
        stream: TcpStream,
        connection: usize,
        state: Arc<DeviceState>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut framed = Framed::new(stream, FrameCodec::new());
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.recv() => break,
                frame = framed.next() => frame,
            };
            let Some(Ok(frame)) = frame else { break };
            let Some(correlation_id) = CorrelationId::from_prefix(&frame) else {
                continue;
            };

            let call = DeviceCall {
                connection,
                correlation_id,
                command: frame.slice(CORRELATION_ID_LEN..),
            };
            state.call_log.write().await.push(call.clone());

            if state.silent.load(Ordering::SeqCst) {
                continue;
            }

            let reply = {
                let responder = state.responder.read().await;
                responder(&call)
            };

            let delay = state.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let response = match reply {
                Reply::Body(body) => {
                    let mut buf = BytesMut::with_capacity(CORRELATION_ID_LEN + body.len());
                    buf.put_slice(correlation_id.as_bytes());
                    buf.put_slice(&body);
                    buf.freeze()
                }
                Reply::Raw(raw) => raw,
                Reply::Silent => continue,
                Reply::Disconnect => break,
            };

            if framed.send(response).await.is_err() {
                break;
            }
        }
    }
}

/// Stock responders.
pub mod responses {
    use super::*;

    /// Answer every command with its response code and error code `00`
    /// (`NC` → `ND00`, `DC` → `DD00`).
    #[must_use]
    pub fn acknowledge() -> Responder {
        with_error_code("00")
    }

    /// Answer every command with its response code and `error_code`.
    #[must_use]
    pub fn with_error_code(error_code: &'static str) -> Responder {
        Arc::new(move |call: &DeviceCall| {
            let mut body = BytesMut::with_capacity(4);
            match call.command.get(..2) {
                Some(&[first, second]) => {
                    body.put_u8(first);
                    body.put_u8(second.wrapping_add(1));
                }
                _ => body.put_slice(b"??"),
            }
            body.put_slice(error_code.as_bytes());
            Reply::Body(body.freeze())
        })
    }

    /// Send every command back unchanged.
    #[must_use]
    pub fn echo() -> Responder {
        Arc::new(|call: &DeviceCall| Reply::Body(call.command.clone()))
    }

    /// Answer with a fixed body.
    #[must_use]
    pub fn fixed(body: &'static [u8]) -> Responder {
        Arc::new(move |_: &DeviceCall| Reply::Body(Bytes::from_static(body)))
    }
}
