use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::arena::{ComponentDescriptor, ComponentStateArena, RequestScope};
use crate::buffer::TextSink;
use crate::config::RenderConfig;
use crate::conventions::ActionConventions;
use crate::correlation::{HandlerBinding, HandlerCorrelationTable};
use crate::error::{RenderError, Result};
use crate::frame::{ComponentId, FrameBuilder, HandlerId, RenderFrame};
use crate::navigation::NavigationRequest;
use crate::walker::{HtmlWalker, WalkSummary};

pub type EventHandler = Arc<dyn Fn(&mut HandlerContext) + Send + Sync>;

/// New frames for one component.
#[derive(Debug, Clone)]
pub struct ComponentUpdate {
    pub component: ComponentId,
    pub frames: Vec<RenderFrame>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderBatch {
    pub updates: Vec<ComponentUpdate>,
    pub disposed: Vec<ComponentId>,
}

impl RenderBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.disposed.is_empty()
    }
}

/// What a finished unit of async work wants done to the tree.
#[derive(Debug, Default)]
pub struct WorkOutcome {
    pub batch: RenderBatch,
    pub navigation: Option<NavigationRequest>,
}

impl WorkOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn update(component: ComponentId, frames: Vec<RenderFrame>) -> Self {
        Self {
            batch: RenderBatch {
                updates: vec![ComponentUpdate { component, frames }],
                disposed: Vec::new(),
            },
            navigation: None,
        }
    }

    pub fn navigate(request: NavigationRequest) -> Self {
        Self {
            batch: RenderBatch::default(),
            navigation: Some(request),
        }
    }
}

pub struct PendingWork {
    pub component: ComponentId,
    pub future: BoxFuture<'static, WorkOutcome>,
}

impl std::fmt::Debug for PendingWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWork")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

/// Handed to an event handler. Everything queued here is applied to the tree
/// after the handler returns.
#[derive(Debug)]
pub struct HandlerContext {
    component: ComponentId,
    batch: RenderBatch,
    work: Vec<PendingWork>,
    navigation: Option<NavigationRequest>,
}

impl HandlerContext {
    fn new(component: ComponentId) -> Self {
        Self {
            component,
            batch: RenderBatch::default(),
            work: Vec::new(),
            navigation: None,
        }
    }

    pub fn component(&self) -> ComponentId {
        self.component
    }

    pub fn update(&mut self, component: ComponentId, frames: Vec<RenderFrame>) {
        self.batch.updates.push(ComponentUpdate { component, frames });
    }

    pub fn navigate_to(&mut self, request: NavigationRequest) {
        self.navigation.get_or_insert(request);
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = WorkOutcome> + Send + 'static,
    {
        self.work.push(PendingWork {
            component: self.component,
            future: future.boxed(),
        });
    }
}

/// Component states, their current frames, their handlers and everything
/// pending against them. Owned by one render dispatcher.
pub struct RenderTree {
    arena: ComponentStateArena,
    frames: AHashMap<ComponentId, Vec<RenderFrame>>,
    handlers: AHashMap<(ComponentId, HandlerId), EventHandler>,
    correlation: HandlerCorrelationTable,
    pending: Vec<PendingWork>,
    navigation: Option<NavigationRequest>,
    conventions: ActionConventions,
    scope: RequestScope,
}

impl RenderTree {
    pub fn new(conventions: ActionConventions) -> Self {
        Self {
            arena: ComponentStateArena::new(),
            frames: AHashMap::new(),
            handlers: AHashMap::new(),
            correlation: HandlerCorrelationTable::new(),
            pending: Vec::new(),
            navigation: None,
            conventions,
            scope: RequestScope::new(),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.conventions())
    }

    pub fn arena(&self) -> &ComponentStateArena {
        &self.arena
    }

    pub fn correlation(&self) -> &HandlerCorrelationTable {
        &self.correlation
    }

    pub fn conventions(&self) -> &ActionConventions {
        &self.conventions
    }

    /// Shared by the fragment conditions of this tree's layouts and targets.
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn frames(&self, component: ComponentId) -> Option<&[RenderFrame]> {
        self.frames.get(&component).map(Vec::as_slice)
    }

    pub fn frame_builder(&self) -> FrameBuilder {
        FrameBuilder::with_conventions(self.conventions.clone())
    }

    pub fn attach(
        &mut self,
        descriptor: ComponentDescriptor,
        parent: Option<ComponentId>,
    ) -> Result<ComponentId> {
        let name = descriptor.name.clone();
        let id = self.arena.create(descriptor, parent)?;
        debug!("attached component {} ({})", id, name);
        Ok(id)
    }

    pub fn set_frames(&mut self, component: ComponentId, frames: Vec<RenderFrame>) -> Result<()> {
        self.apply_batch(RenderBatch {
            updates: vec![ComponentUpdate { component, frames }],
            disposed: Vec::new(),
        })
    }

    /// Replaces frames, keeping the correlation table in step, then disposes
    /// the listed subtrees.
    pub fn apply_batch(&mut self, batch: RenderBatch) -> Result<()> {
        for update in batch.updates {
            if !self.arena.contains(update.component) {
                return Err(RenderError::invariant(format!(
                    "frames supplied for component {} which is not live",
                    update.component
                )));
            }
            if let Some(previous) = self.frames.get(&update.component) {
                self.correlation.dispose_frames(update.component, previous);
            }
            let registered = self.correlation.scan(update.component, &update.frames);
            debug!(
                "component {} now has {} frames ({} bound handlers)",
                update.component,
                update.frames.len(),
                registered
            );
            self.frames.insert(update.component, update.frames);
        }
        for component in batch.disposed {
            self.dispose_subtree(component)?;
        }
        Ok(())
    }

    pub fn register_handler<F>(&mut self, component: ComponentId, handler: HandlerId, f: F)
    where
        F: Fn(&mut HandlerContext) + Send + Sync + 'static,
    {
        self.handlers.insert((component, handler), Arc::new(f));
    }

    /// Disposes `component` and every descendant, deepest first.
    pub fn dispose_subtree(&mut self, component: ComponentId) -> Result<()> {
        for child in self.arena.children(component) {
            self.dispose_subtree(child)?;
        }
        if let Some(frames) = self.frames.remove(&component) {
            self.correlation.dispose_frames(component, &frames);
        }
        self.handlers.retain(|(owner, _), _| *owner != component);
        self.pending.retain(|work| work.component != component);
        self.arena.dispose(component)?;
        debug!("disposed component {}", component);
        Ok(())
    }

    pub fn spawn_work<F>(&mut self, component: ComponentId, future: F)
    where
        F: Future<Output = WorkOutcome> + Send + 'static,
    {
        self.pending.push(PendingWork {
            component,
            future: future.boxed(),
        });
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending_work(&mut self) -> Vec<PendingWork> {
        std::mem::take(&mut self.pending)
    }

    /// The first request wins until it is taken.
    pub fn request_navigation(&mut self, request: NavigationRequest) {
        match &self.navigation {
            Some(existing) => warn!(
                "navigation to '{}' ignored; '{}' already pending",
                request.location, existing.location
            ),
            None => self.navigation = Some(request),
        }
    }

    pub fn take_navigation(&mut self) -> Option<NavigationRequest> {
        self.navigation.take()
    }

    pub fn has_pending_navigation(&self) -> bool {
        self.navigation.is_some()
    }

    /// Runs the handler bound to `fingerprint` exactly once.
    pub fn dispatch(&mut self, fingerprint: u32) -> Result<HandlerBinding> {
        let binding = self
            .correlation
            .resolve(fingerprint, &self.arena)?
            .ok_or(RenderError::UnknownFingerprint(fingerprint))?;
        let handler = self
            .handlers
            .get(&(binding.component, binding.handler))
            .cloned()
            .ok_or_else(|| {
                RenderError::invariant(format!(
                    "handler {} of {} is bound but not registered",
                    binding.handler.0,
                    self.arena.path(binding.component)
                ))
            })?;

        debug!(
            "dispatching {:08x} to handler {} of {}",
            fingerprint,
            binding.handler.0,
            self.arena.path(binding.component)
        );
        let mut context = HandlerContext::new(binding.component);
        handler(&mut context);
        self.absorb_context(context)?;
        Ok(binding)
    }

    /// Applies a finished unit of work. Returns the components whose frames
    /// changed and are still live.
    /// Updates and disposals aimed at components that are already gone are
    /// dropped.
    pub fn apply_outcome(&mut self, outcome: WorkOutcome) -> Result<Vec<ComponentId>> {
        let WorkOutcome {
            mut batch,
            navigation,
        } = outcome;
        let arena = &self.arena;
        batch.updates.retain(|update| {
            let live = arena.contains(update.component);
            if !live {
                debug!("dropping update for disposed component {}", update.component);
            }
            live
        });
        let disposed = std::mem::take(&mut batch.disposed);

        let mut updated: Vec<ComponentId> = batch.updates.iter().map(|u| u.component).collect();
        updated.dedup();
        self.apply_batch(batch)?;
        for component in disposed {
            // An earlier entry may already have taken this one with it.
            if self.arena.contains(component) {
                self.dispose_subtree(component)?;
            }
        }
        if let Some(request) = navigation {
            self.request_navigation(request);
        }
        updated.retain(|&id| self.arena.contains(id));
        Ok(updated)
    }

    pub fn render<S: TextSink + ?Sized>(
        &self,
        root: ComponentId,
        out: &mut S,
    ) -> Result<WalkSummary> {
        HtmlWalker::new(&self.arena, &self.frames, &self.conventions).render(root, out)
    }

    fn absorb_context(&mut self, context: HandlerContext) -> Result<()> {
        let HandlerContext {
            batch,
            work,
            navigation,
            ..
        } = context;
        self.pending.extend(work);
        if let Some(request) = navigation {
            self.request_navigation(request);
        }
        if !batch.is_empty() {
            self.apply_batch(batch)?;
        }
        Ok(())
    }
}
