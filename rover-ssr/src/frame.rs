use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::conventions::ActionConventions;
use crate::error::{RenderError, Result};

/// Arena slot plus the generation it was handed out in, so an id kept past
/// disposal never resolves to whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ComponentId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index)
    }
}

/// A handler registered by a component, e.g. its "save" callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

/// One live occurrence of a handler-bearing attribute. Two buttons bound to
/// the same handler carry distinct event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

impl EventId {
    pub fn next() -> Self {
        Self(NEXT_EVENT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    pub event: EventId,
    pub handler: HandlerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(Arc<str>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Handler(HandlerRef),
}

impl AttributeValue {
    /// String form used for value comparisons (`<option>` against `<select>`).
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(s) => Some(Cow::Borrowed(s.as_ref())),
            Self::Int(n) => Some(Cow::Owned(itoa::Buffer::new().format(*n).to_owned())),
            Self::Float(f) => Some(Cow::Owned(ryu::Buffer::new().format(*f).to_owned())),
            Self::Bool(_) | Self::Handler(_) => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(Arc::from(value))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(Arc::from(value))
    }
}

impl From<Arc<str>> for AttributeValue {
    fn from(value: Arc<str>) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// One flattened node of a component's render output.
///
/// `Element`, `Component` and `Region` count themselves in `subtree_length`,
/// so `position + subtree_length` is always the next sibling.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderFrame {
    Element {
        name: Arc<str>,
        subtree_length: usize,
    },
    Attribute {
        name: Arc<str>,
        value: AttributeValue,
        /// Index of the action attribute this handler attribute is paired with.
        paired_action: Option<usize>,
    },
    Text(Arc<str>),
    Markup(Arc<str>),
    Component {
        id: ComponentId,
        subtree_length: usize,
    },
    Region {
        subtree_length: usize,
    },
    ReferenceCapture,
    NamedEvent {
        event_type: Arc<str>,
        name: Arc<str>,
        scope: Option<Arc<str>>,
    },
}

impl RenderFrame {
    pub fn subtree_length(&self) -> usize {
        match self {
            Self::Element { subtree_length, .. }
            | Self::Component { subtree_length, .. }
            | Self::Region { subtree_length } => *subtree_length,
            _ => 1,
        }
    }

    pub(crate) fn is_start_tag_part(&self) -> bool {
        matches!(
            self,
            Self::Attribute { .. } | Self::NamedEvent { .. } | Self::ReferenceCapture
        )
    }
}

struct OpenFrame {
    index: usize,
    children_started: bool,
}

/// Builds a frame array with correct subtree lengths.
///
/// When an element closes, every handler attribute whose name declares an
/// action kind (`onpost`) is paired with the matching action attribute
/// (`hx-post`) on the same element, so nothing has to search for it later.
pub struct FrameBuilder {
    frames: Vec<RenderFrame>,
    open: Vec<OpenFrame>,
    conventions: ActionConventions,
    error: Option<String>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::with_conventions(ActionConventions::default())
    }

    pub fn with_conventions(conventions: ActionConventions) -> Self {
        Self {
            frames: Vec::new(),
            open: Vec::new(),
            conventions,
            error: None,
        }
    }

    pub fn open_element(&mut self, name: impl Into<Arc<str>>) -> &mut Self {
        self.push_child(RenderFrame::Element {
            name: name.into(),
            subtree_length: 1,
        });
        self.open.push(OpenFrame {
            index: self.frames.len() - 1,
            children_started: false,
        });
        self
    }

    pub fn open_component(&mut self, id: ComponentId) -> &mut Self {
        self.push_child(RenderFrame::Component {
            id,
            subtree_length: 1,
        });
        self.open.push(OpenFrame {
            index: self.frames.len() - 1,
            children_started: false,
        });
        self
    }

    /// A child component without parameters.
    pub fn component(&mut self, id: ComponentId) -> &mut Self {
        self.push_child(RenderFrame::Component {
            id,
            subtree_length: 1,
        });
        self
    }

    pub fn open_region(&mut self) -> &mut Self {
        self.push_child(RenderFrame::Region { subtree_length: 1 });
        self.open.push(OpenFrame {
            index: self.frames.len() - 1,
            children_started: true,
        });
        self
    }

    pub fn attribute(
        &mut self,
        name: impl Into<Arc<str>>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        self.push_start_tag_part(RenderFrame::Attribute {
            name: name.into(),
            value: value.into(),
            paired_action: None,
        })
    }

    /// A handler-bearing attribute; allocates a fresh event id.
    pub fn handler(&mut self, name: impl Into<Arc<str>>, handler: HandlerId) -> &mut Self {
        self.push_start_tag_part(RenderFrame::Attribute {
            name: name.into(),
            value: AttributeValue::Handler(HandlerRef {
                event: EventId::next(),
                handler,
            }),
            paired_action: None,
        })
    }

    pub fn named_event(
        &mut self,
        event_type: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        scope: Option<&str>,
    ) -> &mut Self {
        self.push_start_tag_part(RenderFrame::NamedEvent {
            event_type: event_type.into(),
            name: name.into(),
            scope: scope.filter(|s| !s.is_empty()).map(Arc::from),
        })
    }

    pub fn reference_capture(&mut self) -> &mut Self {
        self.frames.push(RenderFrame::ReferenceCapture);
        self
    }

    pub fn text(&mut self, text: impl Into<Arc<str>>) -> &mut Self {
        self.push_child(RenderFrame::Text(text.into()));
        self
    }

    pub fn markup(&mut self, markup: impl Into<Arc<str>>) -> &mut Self {
        self.push_child(RenderFrame::Markup(markup.into()));
        self
    }

    pub fn close(&mut self) -> &mut Self {
        let Some(open) = self.open.pop() else {
            self.fail("close() without an open frame");
            return self;
        };
        let length = self.frames.len() - open.index;
        match &mut self.frames[open.index] {
            RenderFrame::Element { subtree_length, .. }
            | RenderFrame::Component { subtree_length, .. }
            | RenderFrame::Region { subtree_length } => *subtree_length = length,
            _ => {}
        }
        if matches!(self.frames[open.index], RenderFrame::Element { .. }) {
            self.pair_handlers(open.index);
        }
        self
    }

    pub fn build(self) -> Result<Vec<RenderFrame>> {
        if let Some(error) = self.error {
            return Err(RenderError::invariant(error));
        }
        if !self.open.is_empty() {
            return Err(RenderError::invariant(format!(
                "{} frame(s) left open",
                self.open.len()
            )));
        }
        Ok(self.frames)
    }

    fn push_child(&mut self, frame: RenderFrame) {
        if let Some(parent) = self.open.last_mut() {
            parent.children_started = true;
        }
        self.frames.push(frame);
    }

    fn push_start_tag_part(&mut self, frame: RenderFrame) -> &mut Self {
        match self.open.last() {
            Some(parent) if !parent.children_started => self.frames.push(frame),
            _ => self.fail("attribute added outside an element or component start tag"),
        }
        self
    }

    fn pair_handlers(&mut self, element: usize) {
        let start = element + 1;
        let end = self.frames[start..]
            .iter()
            .position(|f| !f.is_start_tag_part())
            .map_or(self.frames.len(), |offset| start + offset);

        for i in start..end {
            let kind = match &self.frames[i] {
                RenderFrame::Attribute {
                    name,
                    value: AttributeValue::Handler(_),
                    ..
                } => self.conventions.handler_kind(name),
                _ => None,
            };
            let Some(kind) = kind else { continue };

            let action = (start..end).find(|&j| {
                matches!(&self.frames[j], RenderFrame::Attribute { name, value, .. }
                    if !matches!(value, AttributeValue::Handler(_))
                        && self.conventions.is_action_attribute(name, kind))
            });
            if let RenderFrame::Attribute { paired_action, .. } = &mut self.frames[i] {
                *paired_action = action;
            }
        }
    }

    fn fail(&mut self, message: &str) {
        if self.error.is_none() {
            self.error = Some(message.to_string());
        }
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}
