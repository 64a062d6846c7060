use std::mem;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::page::{PageList, PagePool, TextChunk};
use super::TextSink;
use crate::config::RenderConfig;
use crate::error::{RenderError, Result};

const SCRATCH_CAPACITY: usize = 4096;

/// Everything a flush task needs. Owned by the writer while idle and moved
/// into the task while a flush is running.
struct FlushParts<W> {
    sink: W,
    pages: PageList,
    scratch: BytesMut,
}

struct FlushDone<W> {
    parts: FlushParts<W>,
    result: Result<usize>,
}

enum FlushSlot<W> {
    Idle(FlushParts<W>),
    InFlight(JoinHandle<FlushDone<W>>),
    /// The flush task itself died; the sink is gone.
    Lost,
}

/// Paged output buffer with at most one flush in flight.
///
/// The producer only ever appends to `current`. `flush` first waits for the
/// previous flush to hand its page list back, then swaps `current` into the
/// flush task, which therefore owns the pages exclusively until it returns.
pub struct PagedTextWriter<W> {
    current: PageList,
    pool: PagePool,
    slot: FlushSlot<W>,
    cancel: CancellationToken,
    committed: bool,
    flushes: u64,
    bytes_flushed: u64,
}

impl<W> PagedTextWriter<W> {
    pub fn write(&mut self, chunk: TextChunk) {
        self.current.write(chunk, &mut self.pool);
    }

    /// True once any bytes have been handed to the sink.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn buffered_chunks(&self) -> usize {
        self.current.chunk_count()
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drop everything written since the last flush.
    pub fn discard_buffered(&mut self) {
        self.current.recycle(&mut self.pool);
    }
}

impl<W> TextSink for PagedTextWriter<W> {
    #[inline]
    fn write(&mut self, chunk: TextChunk) {
        PagedTextWriter::write(self, chunk);
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> PagedTextWriter<W> {
    pub fn new(sink: W, page_capacity: usize, pool_size: usize, cancel: CancellationToken) -> Self {
        Self {
            current: PageList::new(),
            pool: PagePool::new(page_capacity, pool_size),
            slot: FlushSlot::Idle(FlushParts {
                sink,
                pages: PageList::new(),
                scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
            }),
            cancel,
            committed: false,
            flushes: 0,
            bytes_flushed: 0,
        }
    }

    pub fn from_config(sink: W, config: &RenderConfig, cancel: CancellationToken) -> Self {
        Self::new(sink, config.page_capacity, config.page_pool_size, cancel)
    }

    /// Start writing everything buffered so far. Returns once the previous
    /// flush has completed and the new one has been scheduled; it does not
    /// wait for the new flush to finish.
    pub async fn flush(&mut self) -> Result<()> {
        self.settle().await?;
        if self.current.is_empty() {
            return Ok(());
        }

        let mut parts = match mem::replace(&mut self.slot, FlushSlot::Lost) {
            FlushSlot::Idle(parts) => parts,
            other => {
                self.slot = other;
                return Err(RenderError::invariant("flush slot not idle after settle"));
            }
        };
        mem::swap(&mut self.current, &mut parts.pages);
        self.committed = true;
        self.flushes += 1;

        let flush_no = self.flushes;
        let cancel = self.cancel.clone();
        self.slot = FlushSlot::InFlight(tokio::spawn(async move {
            let started_at = Instant::now();
            let result = write_pages(&mut parts, &cancel).await;
            if let Ok(written) = &result {
                debug!(
                    "flush #{} wrote {} bytes from {} pages in {:.2}ms",
                    flush_no,
                    written,
                    parts.pages.page_count(),
                    started_at.elapsed().as_secs_f64() * 1000.0
                );
            }
            FlushDone { parts, result }
        }));
        Ok(())
    }

    /// Wait for the in-flight flush, if any, and take its pages back.
    async fn settle(&mut self) -> Result<()> {
        match mem::replace(&mut self.slot, FlushSlot::Lost) {
            FlushSlot::Idle(parts) => {
                self.slot = FlushSlot::Idle(parts);
                Ok(())
            }
            FlushSlot::InFlight(handle) => {
                let FlushDone { mut parts, result } = handle
                    .await
                    .map_err(|e| RenderError::FlushTask(e.to_string()))?;
                parts.pages.recycle(&mut self.pool);
                parts.scratch.clear();
                self.slot = FlushSlot::Idle(parts);
                self.bytes_flushed += result? as u64;
                Ok(())
            }
            FlushSlot::Lost => Err(RenderError::FlushTask(
                "output sink was lost by an earlier flush".to_string(),
            )),
        }
    }

    /// The sink, once no flush is touching it.
    pub async fn sink_mut(&mut self) -> Result<&mut W> {
        self.settle().await?;
        match &mut self.slot {
            FlushSlot::Idle(parts) => Ok(&mut parts.sink),
            _ => Err(RenderError::invariant("flush slot not idle after settle")),
        }
    }

    /// Flush what is left, wait for it, and give the sink back.
    pub async fn finish(mut self) -> Result<W> {
        self.flush().await?;
        self.settle().await?;
        match mem::replace(&mut self.slot, FlushSlot::Lost) {
            FlushSlot::Idle(parts) => Ok(parts.sink),
            _ => Err(RenderError::invariant("flush slot not idle after settle")),
        }
    }
}

/// Serializes every page into the scratch buffer and hands it to the sink as
/// one write.
async fn write_pages<W: AsyncWrite + Unpin>(
    parts: &mut FlushParts<W>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let FlushParts {
        sink,
        pages,
        scratch,
    } = parts;

    scratch.clear();
    for page in pages.pages() {
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        for chunk in page.iter() {
            chunk.write_to(scratch);
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RenderError::Cancelled),
        result = async {
            sink.write_all(&scratch[..]).await?;
            sink.flush().await
        } => result?,
    }
    let written = scratch.len();
    scratch.clear();
    Ok(written)
}
