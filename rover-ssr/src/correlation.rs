use ahash::AHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::arena::ComponentStateArena;
use crate::error::{RenderError, Result};
use crate::frame::{AttributeValue, ComponentId, EventId, HandlerId, RenderFrame};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over `name=value`.
pub fn fingerprint(name: &str, value: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in name
        .as_bytes()
        .iter()
        .chain(b"=")
        .chain(value.as_bytes())
    {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fingerprint of the action attribute a handler attribute was paired with.
pub fn paired_fingerprint(frames: &[RenderFrame], handler_frame: usize) -> Option<u32> {
    let RenderFrame::Attribute {
        paired_action: Some(action),
        ..
    } = frames.get(handler_frame)?
    else {
        return None;
    };
    match frames.get(*action)? {
        RenderFrame::Attribute { name, value, .. } => {
            let value = value.as_text()?;
            Some(fingerprint(name, &value))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerBinding {
    pub component: ComponentId,
    pub handler: HandlerId,
}

#[derive(Debug)]
struct BindingEntry {
    binding: HandlerBinding,
    /// Attribute occurrences that currently carry this binding.
    events: SmallVec<[EventId; 2]>,
}

/// Maps action fingerprints to the live (component, handler) pairs bound to
/// them.
#[derive(Debug, Default)]
pub struct HandlerCorrelationTable {
    by_fingerprint: AHashMap<u32, SmallVec<[BindingEntry; 1]>>,
    /// The same built frames may be handed to more than one component, so an
    /// occurrence is only unique together with its owner.
    by_event: AHashMap<(ComponentId, EventId), u32>,
}

impl HandlerCorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fingerprint: u32, binding: HandlerBinding, event: EventId) {
        if let Some(previous) = self.by_event.insert((binding.component, event), fingerprint) {
            if previous == fingerprint {
                return;
            }
            self.remove_event(previous, binding.component, event);
        }
        let entries = self.by_fingerprint.entry(fingerprint).or_default();
        match entries.iter_mut().find(|e| e.binding == binding) {
            Some(entry) => entry.events.push(event),
            None => {
                let mut events = SmallVec::new();
                events.push(event);
                entries.push(BindingEntry { binding, events });
            }
        }
        trace!(
            "registered handler {:?} of component {} under {:08x}",
            binding.handler, binding.component, fingerprint
        );
    }

    /// Registers every paired handler attribute in a component's frames.
    /// Returns how many were registered.
    pub fn scan(&mut self, component: ComponentId, frames: &[RenderFrame]) -> usize {
        let mut registered = 0;
        for (index, frame) in frames.iter().enumerate() {
            let RenderFrame::Attribute {
                value: AttributeValue::Handler(handler),
                ..
            } = frame
            else {
                continue;
            };
            if let Some(fp) = paired_fingerprint(frames, index) {
                self.register(
                    fp,
                    HandlerBinding {
                        component,
                        handler: handler.handler,
                    },
                    handler.event,
                );
                registered += 1;
            }
        }
        registered
    }

    /// Drops one attribute occurrence. The (component, handler) pair goes
    /// away with its last occurrence, the fingerprint with its last pair.
    pub fn dispose_event(&mut self, component: ComponentId, event: EventId) -> bool {
        match self.by_event.remove(&(component, event)) {
            Some(fp) => {
                self.remove_event(fp, component, event);
                true
            }
            None => false,
        }
    }

    /// Drops every handler occurrence `component` registered from `frames`.
    pub fn dispose_frames(&mut self, component: ComponentId, frames: &[RenderFrame]) -> usize {
        frames
            .iter()
            .filter_map(|frame| match frame {
                RenderFrame::Attribute {
                    value: AttributeValue::Handler(handler),
                    ..
                } => Some(handler.event),
                _ => None,
            })
            .filter(|&event| self.dispose_event(component, event))
            .count()
    }

    /// Zero matches is `Ok(None)`; more than one is a fatal
    /// `AmbiguousCorrelation` naming every owning component.
    pub fn resolve(
        &self,
        fingerprint: u32,
        arena: &ComponentStateArena,
    ) -> Result<Option<HandlerBinding>> {
        let Some(entries) = self.by_fingerprint.get(&fingerprint) else {
            debug!("no binding for fingerprint {:08x}", fingerprint);
            return Ok(None);
        };
        match entries.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.binding)),
            many => {
                let components = many
                    .iter()
                    .map(|e| {
                        format!(
                            "{} (handler {})",
                            arena.path(e.binding.component),
                            e.binding.handler.0
                        )
                    })
                    .collect();
                let err = RenderError::AmbiguousCorrelation {
                    fingerprint,
                    components,
                };
                tracing::error!("{}", err);
                Err(err)
            }
        }
    }

    pub fn bindings(&self, fingerprint: u32) -> Vec<HandlerBinding> {
        self.by_fingerprint
            .get(&fingerprint)
            .map(|entries| entries.iter().map(|e| e.binding).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, fingerprint: u32) -> bool {
        self.by_fingerprint.contains_key(&fingerprint)
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    fn remove_event(&mut self, fingerprint: u32, component: ComponentId, event: EventId) {
        let Some(entries) = self.by_fingerprint.get_mut(&fingerprint) else {
            return;
        };
        if let Some(pos) = entries
            .iter()
            .position(|e| e.binding.component == component && e.events.contains(&event))
        {
            let entry = &mut entries[pos];
            entry.events.retain(|e| *e != event);
            if entry.events.is_empty() {
                entries.remove(pos);
            }
        }
        if entries.is_empty() {
            self.by_fingerprint.remove(&fingerprint);
        }
    }
}
