use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Serializes all writes on one connection. Every response PDU goes through
/// here; the mutex guarantees bytes of distinct PDUs never interleave.
#[derive(Clone)]
pub struct MessageWriter {
    stream: Arc<Mutex<BoxedWrite>>,
}

impl MessageWriter {
    pub fn new<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stream: Arc::new(Mutex::new(Box::new(stream))),
        }
    }

    /// Write one complete PDU and flush, holding the lock for the duration.
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_all(frame).await?;
        stream.flush().await
    }

    /// Hold the write lock across several frames, for handlers that stream
    /// a burst of PDUs without letting other workers interleave between them.
    pub async fn lock(&self) -> FrameSink<'_> {
        FrameSink {
            stream: self.stream.lock().await,
        }
    }
}

pub struct FrameSink<'a> {
    stream: MutexGuard<'a, BoxedWrite>,
}

impl FrameSink<'_> {
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }
}
