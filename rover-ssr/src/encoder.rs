use std::sync::Arc;

use crate::buffer::{TextChunk, TextSink};

/// How text content is made safe for the context it is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoder {
    /// Element content and attribute values.
    Html,
    /// Raw text inside `<script>`/`<style>`: only sequences that could end
    /// the element early are neutralised.
    Script,
}

impl TextEncoder {
    /// Elements whose children switch to the script encoder.
    pub fn for_element(name: &str, current: Self) -> Self {
        if name.eq_ignore_ascii_case("script") || name.eq_ignore_ascii_case("style") {
            Self::Script
        } else {
            current
        }
    }

    /// Writes `source` as shared spans plus replacement literals. Text with
    /// nothing to escape is written as a single shared chunk.
    pub fn encode<S: TextSink + ?Sized>(self, source: &Arc<str>, out: &mut S) {
        match self {
            Self::Html => encode_html(source, out),
            Self::Script => encode_script(source, out),
        }
    }
}

fn html_entity(byte: u8) -> Option<&'static str> {
    match byte {
        b'&' => Some("&amp;"),
        b'<' => Some("&lt;"),
        b'>' => Some("&gt;"),
        b'"' => Some("&quot;"),
        b'\'' => Some("&#39;"),
        _ => None,
    }
}

fn encode_html<S: TextSink + ?Sized>(source: &Arc<str>, out: &mut S) {
    let bytes = source.as_bytes();
    let mut last = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(entity) = html_entity(b) {
            if i > last {
                out.write(TextChunk::span(source, last, i));
            }
            out.write(TextChunk::Static(entity));
            last = i + 1;
        }
    }
    finish(source, last, out);
}

fn encode_script<S: TextSink + ?Sized>(source: &Arc<str>, out: &mut S) {
    let bytes = source.as_bytes();
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            let rest = &bytes[i + 1..];
            let replacement = if rest.starts_with(b"/") {
                Some(("<\\/", 2))
            } else if rest.starts_with(b"!--") {
                Some(("<\\!--", 4))
            } else {
                None
            };
            if let Some((literal, consumed)) = replacement {
                if i > last {
                    out.write(TextChunk::span(source, last, i));
                }
                out.write(TextChunk::Static(literal));
                i += consumed;
                last = i;
                continue;
            }
        }
        i += 1;
    }
    finish(source, last, out);
}

fn finish<S: TextSink + ?Sized>(source: &Arc<str>, last: usize, out: &mut S) {
    if last == 0 {
        if !source.is_empty() {
            out.write(TextChunk::Shared(Arc::clone(source)));
        }
    } else if last < source.len() {
        out.write(TextChunk::span(source, last, source.len()));
    }
}
