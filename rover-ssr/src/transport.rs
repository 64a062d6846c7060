use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// The byte sink a response is written to.
pub trait ResponseTransport: AsyncWrite + Unpin + Send + 'static {
    /// Turn off response buffering and compression so each flush reaches the
    /// client as soon as it is written.
    fn enable_streaming(&mut self);

    fn is_streaming(&self) -> bool;
}

/// In-memory transport that keeps every write separately.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    writes: Vec<Vec<u8>>,
    flushes: usize,
    streaming: bool,
    yield_before_write: bool,
    yielded: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Pending` once before accepting each write, like a socket
    /// whose send buffer is momentarily full.
    pub fn yielding() -> Self {
        Self {
            yield_before_write: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn body(&self) -> Vec<u8> {
        self.writes.concat()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }
}

impl ResponseTransport for MemoryTransport {
    fn enable_streaming(&mut self) {
        self.streaming = true;
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.yield_before_write && !this.yielded {
            this.yielded = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        this.yielded = false;
        this.writes.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
