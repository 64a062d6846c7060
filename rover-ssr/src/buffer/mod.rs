mod conditional;
mod page;
mod writer;

pub use conditional::ConditionalWriter;
pub use page::{
    BufferPage, DEFAULT_PAGE_CAPACITY, DEFAULT_POOL_SIZE, PageList, PagePool, TextChunk,
};
pub use writer::PagedTextWriter;

/// Anything the walker can write chunks into.
pub trait TextSink {
    fn write(&mut self, chunk: TextChunk);

    #[inline]
    fn write_static(&mut self, s: &'static str) {
        self.write(TextChunk::Static(s));
    }
}

impl TextSink for String {
    fn write(&mut self, chunk: TextChunk) {
        chunk.push_to(self);
    }
}

impl TextSink for Vec<TextChunk> {
    fn write(&mut self, chunk: TextChunk) {
        self.push(chunk);
    }
}
