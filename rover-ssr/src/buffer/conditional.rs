use super::{TextChunk, TextSink};

/// Passes writes through only while suppression is off, so the walker runs
/// the same traversal whether or not the current component emits.
pub struct ConditionalWriter<'a, S: TextSink + ?Sized> {
    inner: &'a mut S,
    suppressed: bool,
    discarded: usize,
}

impl<'a, S: TextSink + ?Sized> ConditionalWriter<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        Self {
            inner,
            suppressed: false,
            discarded: 0,
        }
    }

    /// Returns the previous flag so callers can restore it.
    pub fn set_suppressed(&mut self, suppressed: bool) -> bool {
        std::mem::replace(&mut self.suppressed, suppressed)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl<S: TextSink + ?Sized> TextSink for ConditionalWriter<'_, S> {
    #[inline]
    fn write(&mut self, chunk: TextChunk) {
        if self.suppressed {
            self.discarded += 1;
        } else {
            self.inner.write(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_dropped_while_suppressed() {
        let mut out = String::new();
        let mut writer = ConditionalWriter::new(&mut out);

        writer.write_static("<a>");
        let previous = writer.set_suppressed(true);
        assert!(!previous);
        writer.write_static("<hidden>");
        writer.write(TextChunk::Int(5));
        writer.set_suppressed(previous);
        writer.write_static("</a>");

        assert_eq!(writer.discarded(), 2);
        assert_eq!(out, "<a></a>");
    }
}
