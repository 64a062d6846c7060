use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RenderError, Result};
use crate::frame::ComponentId;

/// Decides whether a component contributes markup to the current response,
/// given how many live conditional components sit beneath it.
pub trait OutputCondition: Send + Sync {
    fn should_emit(&self, qualifying_descendants: usize) -> bool;
}

impl<F> OutputCondition for F
where
    F: Fn(usize) -> bool + Send + Sync,
{
    fn should_emit(&self, qualifying_descendants: usize) -> bool {
        self(qualifying_descendants)
    }
}

/// Resolved once when the descriptor is built; never re-inspected per render.
#[derive(Clone)]
pub enum OutputMode {
    Always,
    Conditional(Arc<dyn OutputCondition>),
}

impl std::fmt::Debug for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Conditional(_) => write!(f, "Conditional"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub name: Arc<str>,
    pub output: OutputMode,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            output: OutputMode::Always,
        }
    }

    pub fn conditional(name: impl Into<Arc<str>>, condition: impl OutputCondition + 'static) -> Self {
        Self {
            name: name.into(),
            output: OutputMode::Conditional(Arc::new(condition)),
        }
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self.output, OutputMode::Conditional(_))
    }
}

/// Whether the request being rendered asked for a fragment. Shared by the
/// fragment conditions of every component in a tree.
#[derive(Debug, Clone, Default)]
pub struct RequestScope(Arc<AtomicBool>);

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fragment(&self, fragment: bool) {
        self.0.store(fragment, Ordering::Release);
    }

    pub fn is_fragment(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// For page and layout components: emit normally, but on a fragment
    /// request stay silent whenever a fragment target lives beneath.
    pub fn layout(&self) -> OutputMode {
        let scope = self.clone();
        OutputMode::Conditional(Arc::new(move |targets: usize| {
            !scope.is_fragment() || targets == 0
        }))
    }

    /// For the region a fragment request is after: always emits.
    pub fn target(&self) -> OutputMode {
        OutputMode::Conditional(Arc::new(|_: usize| true))
    }
}

struct ComponentState {
    descriptor: ComponentDescriptor,
    conditional_descendants: usize,
    live_children: usize,
}

/// Component states addressed by id. The parent link is a plain id, so the
/// arena owns every state and no state owns another.
pub struct ComponentStateArena {
    states: Vec<Option<ComponentState>>,
    parents: Vec<Option<ComponentId>>,
    generations: Vec<u32>,
    free_list: Vec<u32>,
}

impl ComponentStateArena {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            parents: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
        }
    }

    pub fn create(
        &mut self,
        descriptor: ComponentDescriptor,
        parent: Option<ComponentId>,
    ) -> Result<ComponentId> {
        if let Some(parent) = parent {
            if self.state(parent).is_none() {
                return Err(RenderError::invariant(format!(
                    "parent component {} is not live",
                    parent
                )));
            }
        }
        let conditional = descriptor.is_conditional();

        let index = if let Some(idx) = self.free_list.pop() {
            idx as usize
        } else {
            self.states.len()
        };
        let state = ComponentState {
            descriptor,
            conditional_descendants: 0,
            live_children: 0,
        };
        if index >= self.states.len() {
            self.states.push(Some(state));
            self.parents.push(parent);
            self.generations.push(0);
        } else {
            self.states[index] = Some(state);
            self.parents[index] = parent;
        }
        let id = ComponentId {
            index: index as u32,
            generation: self.generations[index],
        };

        if let Some(parent) = parent {
            if let Some(state) = self.state_mut(parent) {
                state.live_children += 1;
            }
            if conditional {
                let mut cursor = Some(parent);
                while let Some(ancestor) = cursor {
                    if let Some(state) = self.state_mut(ancestor) {
                        state.conditional_descendants += 1;
                    }
                    cursor = self.parent(ancestor);
                }
            }
        }

        Ok(id)
    }

    /// Children must be disposed first.
    pub fn dispose(&mut self, id: ComponentId) -> Result<()> {
        let Some(state) = self.state(id) else {
            return Err(RenderError::invariant(format!(
                "component {} disposed twice",
                id
            )));
        };
        if state.live_children > 0 {
            return Err(RenderError::invariant(format!(
                "component {} disposed with {} live children",
                id, state.live_children
            )));
        }
        let conditional = state.descriptor.is_conditional();
        let parent = self.parent(id);

        if let Some(parent) = parent {
            if let Some(state) = self.state_mut(parent) {
                state.live_children -= 1;
            }
        }
        if conditional {
            let mut cursor = parent;
            while let Some(ancestor) = cursor {
                let Some(state) = self.state_mut(ancestor) else {
                    break;
                };
                state.conditional_descendants =
                    state.conditional_descendants.checked_sub(1).ok_or_else(|| {
                        RenderError::invariant(format!(
                            "conditional descendant count of component {} went negative",
                            ancestor
                        ))
                    })?;
                cursor = self.parent(ancestor);
            }
        }

        let idx = id.index as usize;
        self.states[idx] = None;
        self.parents[idx] = None;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_list.push(id.index);
        Ok(())
    }

    /// Walks up until a component with a conditional descriptor answers.
    /// Without one anywhere on the chain the answer is "emit".
    pub fn should_emit(&self, id: ComponentId) -> Result<bool> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let state = self.state(current).ok_or_else(|| {
                RenderError::invariant(format!("component {} is not live", current))
            })?;
            if let OutputMode::Conditional(condition) = &state.descriptor.output {
                return Ok(condition.should_emit(state.conditional_descendants));
            }
            cursor = self.parent(current);
        }
        Ok(true)
    }

    pub fn conditional_descendants(&self, id: ComponentId) -> usize {
        self.state(id).map_or(0, |s| s.conditional_descendants)
    }

    pub fn parent(&self, id: ComponentId) -> Option<ComponentId> {
        self.state(id)?;
        *self.parents.get(id.index as usize)?
    }

    pub fn descriptor(&self, id: ComponentId) -> Option<&ComponentDescriptor> {
        self.state(id).map(|s| &s.descriptor)
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.state(id).is_some()
    }

    /// Live components whose parent is `id`.
    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(idx, parent)| **parent == Some(id) && self.states[*idx].is_some())
            .map(|(idx, _)| ComponentId {
                index: idx as u32,
                generation: self.generations[idx],
            })
            .collect()
    }

    /// `App/Layout/Counter`, root first.
    pub fn path(&self, id: ComponentId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.descriptor(current) {
                Some(d) => names.push(d.name.clone()),
                None => break,
            }
            cursor = self.parent(current);
        }
        let mut path = String::new();
        for (i, name) in names.iter().rev().enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(name);
        }
        if path.is_empty() {
            path = format!("<disposed {}>", id);
        }
        path
    }

    pub fn len(&self) -> usize {
        self.states.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_current(&self, id: ComponentId) -> bool {
        self.generations.get(id.index as usize) == Some(&id.generation)
    }

    fn state(&self, id: ComponentId) -> Option<&ComponentState> {
        if !self.is_current(id) {
            return None;
        }
        self.states.get(id.index as usize)?.as_ref()
    }

    fn state_mut(&mut self, id: ComponentId) -> Option<&mut ComponentState> {
        if !self.is_current(id) {
            return None;
        }
        self.states.get_mut(id.index as usize)?.as_mut()
    }
}

impl Default for ComponentStateArena {
    fn default() -> Self {
        Self::new()
    }
}
