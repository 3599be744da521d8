//! Capability contracts for pooled resources.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;

/// Anything the pool can hand out and later destroy.
pub trait PoolItem: Send + 'static {
    /// Tear the resource down.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

impl PoolItem for TcpStream {
    fn close(mut self) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.shutdown().await?;
            Ok(())
        }
    }
}

/// Creates new pool resources on demand.
pub type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Box an async closure into a [`Factory`].
pub fn boxed_factory<T, F, Fut>(factory: F) -> Factory<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move || factory().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_stream_close_sends_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        PoolItem::close(client).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_boxed_factory() {
        let factory: Factory<u32> = boxed_factory(|| async { Ok(7) });
        assert_eq!(factory().await.unwrap(), 7);
    }
}
