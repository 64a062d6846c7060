use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::arena::ComponentStateArena;
use crate::buffer::{ConditionalWriter, TextChunk, TextSink};
use crate::conventions::ActionConventions;
use crate::correlation::paired_fingerprint;
use crate::encoder::TextEncoder;
use crate::error::{RenderError, Result};
use crate::frame::{AttributeValue, ComponentId, RenderFrame};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Where the walker finds each component's current frame array.
pub trait FrameSource {
    fn frames(&self, component: ComponentId) -> Option<&[RenderFrame]>;
}

impl FrameSource for AHashMap<ComponentId, Vec<RenderFrame>> {
    fn frames(&self, component: ComponentId) -> Option<&[RenderFrame]> {
        self.get(&component).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub elements: usize,
    pub components: usize,
    /// Walked with output suppressed because a conditional descendant might emit.
    pub suppressed_components: usize,
    /// Not walked at all.
    pub skipped_subtrees: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Textarea,
    Select,
    Option,
    Form,
    Other,
}

impl ElementKind {
    fn of(name: &str) -> Self {
        if name.eq_ignore_ascii_case("textarea") {
            Self::Textarea
        } else if name.eq_ignore_ascii_case("select") {
            Self::Select
        } else if name.eq_ignore_ascii_case("option") {
            Self::Option
        } else if name.eq_ignore_ascii_case("form") {
            Self::Form
        } else {
            Self::Other
        }
    }
}

/// State inherited by descendants: the active text encoder and the value of
/// the nearest enclosing `<select>`.
#[derive(Debug, Clone)]
struct Ambient {
    encoder: TextEncoder,
    selected: Option<Arc<str>>,
}

/// Writes HTML for a component and everything beneath it.
pub struct HtmlWalker<'a, F: FrameSource + ?Sized> {
    arena: &'a ComponentStateArena,
    source: &'a F,
    conventions: &'a ActionConventions,
    ambient: Ambient,
    summary: WalkSummary,
}

impl<'a, F: FrameSource + ?Sized> HtmlWalker<'a, F> {
    pub fn new(
        arena: &'a ComponentStateArena,
        source: &'a F,
        conventions: &'a ActionConventions,
    ) -> Self {
        Self {
            arena,
            source,
            conventions,
            ambient: Ambient {
                encoder: TextEncoder::Html,
                selected: None,
            },
            summary: WalkSummary::default(),
        }
    }

    pub fn summary(&self) -> WalkSummary {
        self.summary
    }

    pub fn render<S: TextSink + ?Sized>(
        &mut self,
        root: ComponentId,
        out: &mut S,
    ) -> Result<WalkSummary> {
        let started_at = Instant::now();
        let mut writer = ConditionalWriter::new(out);
        self.render_component(root, &mut writer)?;
        debug!(
            "rendered component {} ({} elements, {} components, {} skipped, {} chunks discarded) in {:.2}ms",
            root,
            self.summary.elements,
            self.summary.components,
            self.summary.skipped_subtrees,
            writer.discarded(),
            started_at.elapsed().as_secs_f64() * 1000.0
        );
        Ok(self.summary)
    }

    /// Renders `count` frames of `frames` starting at `position` and returns
    /// the position after them.
    pub fn render_frames<S: TextSink + ?Sized>(
        &mut self,
        component: ComponentId,
        frames: &[RenderFrame],
        position: usize,
        count: usize,
        out: &mut ConditionalWriter<'_, S>,
    ) -> Result<usize> {
        let end = position
            .checked_add(count)
            .filter(|&end| end <= frames.len())
            .ok_or_else(|| {
                RenderError::invariant(format!(
                    "frame range {}+{} exceeds the {} frames of component {}",
                    position,
                    count,
                    frames.len(),
                    component
                ))
            })?;

        let mut pos = position;
        while pos < end {
            let next = self.render_frame(component, frames, pos, out)?;
            if next <= pos {
                return Err(RenderError::invariant(format!(
                    "walker step at frame {} of component {} consumed no frames",
                    pos, component
                )));
            }
            pos = next;
        }
        if pos != end {
            return Err(RenderError::invariant(format!(
                "frames of component {} overran their range ({} > {})",
                component, pos, end
            )));
        }
        Ok(pos)
    }

    fn render_component<S: TextSink + ?Sized>(
        &mut self,
        id: ComponentId,
        out: &mut ConditionalWriter<'_, S>,
    ) -> Result<()> {
        self.summary.components += 1;
        let emit = self.arena.should_emit(id)?;
        if !emit {
            if self.arena.conditional_descendants(id) == 0 {
                trace!("component {} suppressed; subtree skipped", self.arena.path(id));
                self.summary.skipped_subtrees += 1;
                return Ok(());
            }
            trace!(
                "component {} suppressed; walking for conditional descendants",
                self.arena.path(id)
            );
            self.summary.suppressed_components += 1;
        }

        let source: &'a F = self.source;
        let Some(frames) = source.frames(id) else {
            return Ok(());
        };
        let previous = out.set_suppressed(!emit);
        let result = self.render_frames(id, frames, 0, frames.len(), out);
        out.set_suppressed(previous);
        result.map(|_| ())
    }

    fn render_frame<S: TextSink + ?Sized>(
        &mut self,
        component: ComponentId,
        frames: &[RenderFrame],
        pos: usize,
        out: &mut ConditionalWriter<'_, S>,
    ) -> Result<usize> {
        let frame = &frames[pos];
        let length = frame.subtree_length();
        if length == 0 || pos + length > frames.len() {
            return Err(RenderError::invariant(format!(
                "frame {} of component {} has invalid subtree length {}",
                pos, component, length
            )));
        }

        match frame {
            RenderFrame::Element { name, .. } => {
                self.render_element(component, frames, pos, name, length, out)
            }
            RenderFrame::Text(text) => {
                self.ambient.encoder.encode(text, out);
                Ok(pos + 1)
            }
            RenderFrame::Markup(markup) => {
                out.write(TextChunk::Shared(Arc::clone(markup)));
                Ok(pos + 1)
            }
            RenderFrame::Component { id, .. } => {
                // Frames inside a component frame are its parameters, not output.
                self.render_component(*id, out)?;
                Ok(pos + length)
            }
            RenderFrame::Region { .. } => {
                self.render_frames(component, frames, pos + 1, length - 1, out)?;
                Ok(pos + length)
            }
            RenderFrame::ReferenceCapture => Ok(pos + 1),
            RenderFrame::Attribute { name, .. } => Err(RenderError::invariant(format!(
                "attribute '{}' at frame {} of component {} is outside a start tag",
                name, pos, component
            ))),
            RenderFrame::NamedEvent { name, .. } => Err(RenderError::invariant(format!(
                "named event '{}' at frame {} of component {} is outside a start tag",
                name, pos, component
            ))),
        }
    }

    fn render_element<S: TextSink + ?Sized>(
        &mut self,
        component: ComponentId,
        frames: &[RenderFrame],
        pos: usize,
        name: &Arc<str>,
        length: usize,
        out: &mut ConditionalWriter<'_, S>,
    ) -> Result<usize> {
        let end = pos + length;
        let attrs_end = frames[pos + 1..end]
            .iter()
            .position(|f| !f.is_start_tag_part())
            .map_or(end, |offset| pos + 1 + offset);
        let kind = ElementKind::of(name);
        self.summary.elements += 1;

        out.write_static("<");
        out.write(TextChunk::Shared(Arc::clone(name)));

        let mut text_value: Option<&AttributeValue> = None;
        let mut select_value: Option<Arc<str>> = None;
        let mut option_value: Option<Cow<'_, str>> = None;
        let mut fingerprint_written = false;
        let mut named_event = None;

        for index in pos + 1..attrs_end {
            match &frames[index] {
                RenderFrame::Attribute {
                    name: attribute,
                    value,
                    ..
                } => match value {
                    AttributeValue::Handler(_) => {
                        if fingerprint_written {
                            continue;
                        }
                        if let Some(fp) = paired_fingerprint(frames, index) {
                            out.write_static(" ");
                            out.write(TextChunk::Shared(Arc::clone(
                                &self.conventions.fingerprint_attribute,
                            )));
                            out.write_static("=\"");
                            out.write(TextChunk::Int(fp as i64));
                            out.write_static("\"");
                            fingerprint_written = true;
                        }
                    }
                    _ if kind == ElementKind::Textarea && attribute.eq_ignore_ascii_case("value") => {
                        text_value = Some(value);
                    }
                    _ if kind == ElementKind::Select && attribute.eq_ignore_ascii_case("value") => {
                        select_value = value.as_text().map(|v| Arc::from(v.as_ref()));
                    }
                    _ => {
                        if kind == ElementKind::Option && attribute.eq_ignore_ascii_case("value") {
                            option_value = value.as_text();
                        }
                        write_attribute(attribute, value, out);
                    }
                },
                RenderFrame::NamedEvent { .. } => {
                    named_event.get_or_insert(index);
                }
                _ => {}
            }
        }

        if kind == ElementKind::Option {
            if let (Some(value), Some(selected)) = (&option_value, &self.ambient.selected) {
                if value.as_ref() == selected.as_ref() {
                    out.write_static(" selected");
                }
            }
        }

        let form_binding = named_event.filter(|&index| enclosed_by_form(frames, index, kind));
        if is_void(name) {
            if attrs_end < end {
                return Err(RenderError::invariant(format!(
                    "void element <{}> at frame {} of component {} has children",
                    name, pos, component
                )));
            }
            out.write_static(" />");
            // Void elements cannot hold the field, so it follows as a sibling.
            if let Some(index) = form_binding {
                self.write_handler_field(&frames[index], out);
            }
            return Ok(end);
        }

        let has_content = attrs_end < end || text_value.is_some() || form_binding.is_some();
        if !has_content {
            out.write_static("></");
            out.write(TextChunk::Shared(Arc::clone(name)));
            out.write_static(">");
            return Ok(end);
        }

        out.write_static(">");
        if let Some(index) = form_binding {
            self.write_handler_field(&frames[index], out);
        }

        let saved = self.ambient.clone();
        self.ambient.encoder = TextEncoder::for_element(name, saved.encoder);
        if kind == ElementKind::Select {
            self.ambient.selected = select_value;
        }
        if let Some(value) = text_value {
            write_value_text(value, out);
        }
        let result = self.render_frames(component, frames, attrs_end, end - attrs_end, out);
        self.ambient = saved;
        result?;

        out.write_static("</");
        out.write(TextChunk::Shared(Arc::clone(name)));
        out.write_static(">");
        Ok(end)
    }

    fn write_handler_field<S: TextSink + ?Sized>(
        &self,
        frame: &RenderFrame,
        out: &mut ConditionalWriter<'_, S>,
    ) {
        let RenderFrame::NamedEvent { name, scope, .. } = frame else {
            return;
        };
        out.write_static("<input type=\"hidden\" name=\"");
        out.write(TextChunk::Shared(Arc::clone(
            &self.conventions.handler_field_name,
        )));
        out.write_static("\" value=\"");
        if let Some(scope) = scope {
            out.write(TextChunk::Char('['));
            TextEncoder::Html.encode(scope, out);
            out.write(TextChunk::Char(']'));
        }
        TextEncoder::Html.encode(name, out);
        out.write_static("\" />");
    }
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(name))
}

/// Looks backward from a named event for a `<form>` whose subtree covers it.
fn enclosed_by_form(frames: &[RenderFrame], index: usize, own_kind: ElementKind) -> bool {
    if own_kind == ElementKind::Form {
        return true;
    }
    frames[..index].iter().enumerate().rev().any(|(start, frame)| {
        matches!(frame, RenderFrame::Element { name, subtree_length }
            if start + subtree_length > index && ElementKind::of(name) == ElementKind::Form)
    })
}

fn write_attribute<S: TextSink + ?Sized>(name: &Arc<str>, value: &AttributeValue, out: &mut S) {
    match value {
        AttributeValue::Bool(false) | AttributeValue::Handler(_) => {}
        AttributeValue::Bool(true) => {
            out.write_static(" ");
            out.write(TextChunk::Shared(Arc::clone(name)));
        }
        value => {
            out.write_static(" ");
            out.write(TextChunk::Shared(Arc::clone(name)));
            out.write_static("=\"");
            write_value_text(value, out);
            out.write_static("\"");
        }
    }
}

fn write_value_text<S: TextSink + ?Sized>(value: &AttributeValue, out: &mut S) {
    match value {
        AttributeValue::Text(text) => TextEncoder::Html.encode(text, out),
        AttributeValue::Int(n) => out.write(TextChunk::Int(*n)),
        AttributeValue::Float(f) => out.write(TextChunk::Float(*f)),
        AttributeValue::Bool(_) | AttributeValue::Handler(_) => {}
    }
}
