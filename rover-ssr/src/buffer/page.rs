use std::sync::Arc;

use bytes::{BufMut, BytesMut};

pub const DEFAULT_PAGE_CAPACITY: usize = 128;
pub const DEFAULT_POOL_SIZE: usize = 16;

/// One piece of pending output. Numbers and spans are formatted only when
/// the page is serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum TextChunk {
    Static(&'static str),
    Shared(Arc<str>),
    Char(char),
    /// Byte range into a shared string.
    Span {
        source: Arc<str>,
        start: usize,
        end: usize,
    },
    Int(i64),
    Float(f64),
}

impl TextChunk {
    pub fn span(source: &Arc<str>, start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= source.len());
        Self::Span {
            source: Arc::clone(source),
            start,
            end,
        }
    }

    pub(crate) fn write_to(&self, scratch: &mut BytesMut) {
        match self {
            Self::Static(s) => scratch.put_slice(s.as_bytes()),
            Self::Shared(s) => scratch.put_slice(s.as_bytes()),
            Self::Char(c) => {
                let mut buf = [0u8; 4];
                scratch.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Self::Span { source, start, end } => {
                scratch.put_slice(source.as_bytes().get(*start..*end).unwrap_or_default())
            }
            Self::Int(n) => {
                let mut buf = itoa::Buffer::new();
                scratch.put_slice(buf.format(*n).as_bytes());
            }
            Self::Float(f) => {
                let mut buf = ryu::Buffer::new();
                scratch.put_slice(buf.format(*f).as_bytes());
            }
        }
    }

    pub(crate) fn push_to(&self, out: &mut String) {
        match self {
            Self::Static(s) => out.push_str(s),
            Self::Shared(s) => out.push_str(s),
            Self::Char(c) => out.push(*c),
            Self::Span { source, start, end } => {
                out.push_str(source.get(*start..*end).unwrap_or_default())
            }
            Self::Int(n) => out.push_str(itoa::Buffer::new().format(*n)),
            Self::Float(f) => out.push_str(ryu::Buffer::new().format(*f)),
        }
    }
}

impl From<&'static str> for TextChunk {
    fn from(value: &'static str) -> Self {
        Self::Static(value)
    }
}

impl From<Arc<str>> for TextChunk {
    fn from(value: Arc<str>) -> Self {
        Self::Shared(value)
    }
}

impl From<char> for TextChunk {
    fn from(value: char) -> Self {
        Self::Char(value)
    }
}

impl From<i64> for TextChunk {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Fixed-capacity run of chunks. Never grows past the capacity it was
/// created with.
#[derive(Debug)]
pub struct BufferPage {
    chunks: Vec<TextChunk>,
    capacity: usize,
}

impl BufferPage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.chunks.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hands the chunk back when the page is full.
    #[inline]
    pub fn push(&mut self, chunk: TextChunk) -> Result<(), TextChunk> {
        if self.is_full() {
            return Err(chunk);
        }
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextChunk> {
        self.chunks.iter()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// Recycles cleared pages so steady-state rendering does not allocate.
pub struct PagePool {
    pages: Vec<BufferPage>,
    page_capacity: usize,
    max_pooled: usize,
}

impl PagePool {
    pub fn new(page_capacity: usize, max_pooled: usize) -> Self {
        // Pre-warm
        let mut pages = Vec::with_capacity(max_pooled);
        for _ in 0..max_pooled {
            pages.push(BufferPage::new(page_capacity));
        }

        Self {
            pages,
            page_capacity,
            max_pooled,
        }
    }

    #[inline]
    pub fn get_page(&mut self) -> BufferPage {
        self.pages
            .pop()
            .unwrap_or_else(|| BufferPage::new(self.page_capacity))
    }

    #[inline]
    pub fn return_page(&mut self, mut page: BufferPage) {
        page.clear();
        if self.pages.len() < self.max_pooled && page.capacity() == self.page_capacity {
            self.pages.push(page);
        }
        // Drop if pool is full
    }

    pub fn available(&self) -> usize {
        self.pages.len()
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_CAPACITY, DEFAULT_POOL_SIZE)
    }
}

/// Ordered pages of one buffer generation ("current" or "previous").
/// Appending a page never moves the chunks of earlier pages.
#[derive(Debug, Default)]
pub struct PageList {
    pages: Vec<BufferPage>,
    chunks: usize,
}

impl PageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, chunk: TextChunk, pool: &mut PagePool) {
        let chunk = match self.pages.last_mut() {
            Some(page) => match page.push(chunk) {
                Ok(()) => {
                    self.chunks += 1;
                    return;
                }
                Err(chunk) => chunk,
            },
            None => chunk,
        };

        let mut page = pool.get_page();
        // A fresh page always has room for at least one chunk.
        let _ = page.push(chunk);
        self.pages.push(page);
        self.chunks += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> impl Iterator<Item = &BufferPage> {
        self.pages.iter()
    }

    /// Clears every page and hands it back to the pool.
    pub fn recycle(&mut self, pool: &mut PagePool) {
        for page in self.pages.drain(..) {
            pool.return_page(page);
        }
        self.chunks = 0;
    }

    pub fn to_string_lossy(&self) -> String {
        let mut out = String::new();
        for page in &self.pages {
            for chunk in page.iter() {
                chunk.push_to(&mut out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rejects_chunk_when_full() {
        let mut page = BufferPage::new(2);
        assert!(page.push(TextChunk::Char('a')).is_ok());
        assert!(page.push(TextChunk::Char('b')).is_ok());
        assert_eq!(page.push(TextChunk::Char('c')), Err(TextChunk::Char('c')));
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_page_list_links_new_pages() {
        let mut pool = PagePool::new(2, 0);
        let mut list = PageList::new();
        for i in 0..5 {
            list.write(TextChunk::Int(i), &mut pool);
        }
        assert_eq!(list.page_count(), 3);
        assert_eq!(list.chunk_count(), 5);
        assert_eq!(list.to_string_lossy(), "01234");
    }

    #[test]
    fn test_recycled_pages_return_to_pool() {
        let mut pool = PagePool::new(4, 2);
        assert_eq!(pool.available(), 2);

        let mut list = PageList::new();
        for _ in 0..9 {
            list.write(TextChunk::Static("x"), &mut pool);
        }
        assert_eq!(pool.available(), 0);

        list.recycle(&mut pool);
        assert!(list.is_empty());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_chunks_format_at_serialization() {
        let source: Arc<str> = Arc::from("hello world");
        let chunks = [
            TextChunk::span(&source, 6, 11),
            TextChunk::Char(' '),
            TextChunk::Int(-42),
            TextChunk::Char(' '),
            TextChunk::Float(1.5),
            TextChunk::Static(" ✓"),
        ];

        let mut scratch = BytesMut::new();
        let mut text = String::new();
        for chunk in &chunks {
            chunk.write_to(&mut scratch);
            chunk.push_to(&mut text);
        }
        assert_eq!(&scratch[..], "world -42 1.5 ✓".as_bytes());
        assert_eq!(text, "world -42 1.5 ✓");
    }
}
