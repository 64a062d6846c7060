use std::sync::Arc;
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::buffer::{PagedTextWriter, TextChunk, TextSink};
use crate::config::RenderConfig;
use crate::error::{RenderError, Result};
use crate::frame::ComponentId;
use crate::navigation::{Redirect, RedirectPolicy};
use crate::transport::ResponseTransport;
use crate::tree::{RenderTree, WorkOutcome};

/// Outstanding async work for one render. Quiescent once it is empty.
#[derive(Default)]
pub struct Quiescence {
    work: FuturesUnordered<BoxFuture<'static, (ComponentId, WorkOutcome)>>,
}

impl Quiescence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the tree's newly spawned work into this set.
    pub fn absorb(&mut self, tree: &mut RenderTree) -> usize {
        let pending = tree.take_pending_work();
        let count = pending.len();
        for work in pending {
            let component = work.component;
            let future = work.future;
            self.work.push(Box::pin(async move { (component, future.await) }));
        }
        count
    }

    pub fn is_quiescent(&self) -> bool {
        self.work.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.work.len()
    }

    /// The next unit to finish, or `None` once quiescent.
    pub async fn next(&mut self) -> Option<(ComponentId, WorkOutcome)> {
        self.work.next().await
    }

    /// A unit that is already finished, without waiting for one.
    pub fn try_next(&mut self) -> Option<(ComponentId, WorkOutcome)> {
        self.work.next().now_or_never().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Completed { bytes: u64, streamed: bool },
    Redirect(Redirect),
}

/// Drives one render of a tree to quiescence.
#[derive(Debug, Clone)]
pub struct RenderCoordinator {
    policy: RedirectPolicy,
    page_capacity: usize,
    page_pool_size: usize,
    update_attribute: Arc<str>,
}

impl RenderCoordinator {
    pub fn new(policy: RedirectPolicy, config: &RenderConfig) -> Self {
        Self {
            policy,
            page_capacity: config.page_capacity,
            page_pool_size: config.page_pool_size,
            update_attribute: Arc::from(config.update_attribute.as_str()),
        }
    }

    pub fn from_config(config: &RenderConfig) -> anyhow::Result<Self> {
        Ok(Self::new(RedirectPolicy::from_config(config)?, config))
    }

    pub fn policy(&self) -> &RedirectPolicy {
        &self.policy
    }

    /// Renders `root`, then either sends the whole document in one write or,
    /// if async work is still outstanding, switches the transport to
    /// streaming and flushes each update as it lands. The transport is
    /// handed back in both cases.
    pub async fn render<T: ResponseTransport>(
        &self,
        tree: &mut RenderTree,
        root: ComponentId,
        transport: T,
        cancel: CancellationToken,
    ) -> Result<(RenderOutcome, T)> {
        let started_at = Instant::now();
        let mut writer = PagedTextWriter::new(
            transport,
            self.page_capacity,
            self.page_pool_size,
            cancel.clone(),
        );

        tree.render(root, &mut writer)?;

        // Nothing is sent yet, so work that already finished still lands in
        // the first response.
        let mut quiescence = Quiescence::new();
        quiescence.absorb(tree);
        let folded = self.apply_ready(tree, &mut quiescence)?;

        if let Some(request) = tree.take_navigation() {
            writer.discard_buffered();
            let redirect = self.policy.resolve(&request);
            debug!("render of component {} redirected: {:?}", root, redirect);
            return Ok((RenderOutcome::Redirect(redirect), writer.finish().await?));
        }
        if folded > 0 {
            debug!("{} finished units folded into the first pass; re-rendering", folded);
            writer.discard_buffered();
            tree.render(root, &mut writer)?;
        }

        if quiescence.is_quiescent() {
            let (bytes, transport) = close(writer).await?;
            debug!(
                "rendered component {} in one write ({} bytes, {:.2}ms)",
                root,
                bytes,
                started_at.elapsed().as_secs_f64() * 1000.0
            );
            return Ok((
                RenderOutcome::Completed {
                    bytes,
                    streamed: false,
                },
                transport,
            ));
        }

        debug!(
            "{} async units outstanding after first pass; streaming",
            quiescence.outstanding()
        );
        writer.sink_mut().await?.enable_streaming();
        writer.flush().await?;

        let mut updates = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RenderError::Cancelled),
                next = quiescence.next() => next,
            };
            let Some((component, outcome)) = next else {
                break;
            };
            if !tree.arena().contains(component) {
                debug!("dropping work of disposed component {}", component);
                continue;
            }

            let changed = tree.apply_outcome(outcome)?;
            if let Some(request) = tree.take_navigation() {
                let err = RenderError::NavigationAfterCommit {
                    location: request.location,
                };
                error!("work of component {} failed the render: {}", component, err);
                return Err(err);
            }
            quiescence.absorb(tree);

            for id in changed {
                self.write_update(tree, id, &mut writer)?;
                updates += 1;
            }
            writer.flush().await?;
        }

        let (bytes, transport) = close(writer).await?;
        debug!(
            "streamed component {} with {} updates ({} bytes, {:.2}ms)",
            root,
            updates,
            bytes,
            started_at.elapsed().as_secs_f64() * 1000.0
        );
        Ok((
            RenderOutcome::Completed {
                bytes,
                streamed: true,
            },
            transport,
        ))
    }

    /// Applies every unit that has already finished, including units they
    /// spawn that finish straight away. Stops early once a navigation is
    /// pending. Returns how many outcomes were applied.
    fn apply_ready(&self, tree: &mut RenderTree, quiescence: &mut Quiescence) -> Result<usize> {
        let mut applied = 0;
        while !tree.has_pending_navigation() {
            let Some((component, outcome)) = quiescence.try_next() else {
                break;
            };
            if !tree.arena().contains(component) {
                debug!("dropping work of disposed component {}", component);
                continue;
            }
            tree.apply_outcome(outcome)?;
            quiescence.absorb(tree);
            applied += 1;
        }
        Ok(applied)
    }

    /// `<template data-update="{id}">…</template>`
    fn write_update<T: ResponseTransport>(
        &self,
        tree: &RenderTree,
        component: ComponentId,
        writer: &mut PagedTextWriter<T>,
    ) -> Result<()> {
        writer.write_static("<template ");
        writer.write(TextChunk::Shared(Arc::clone(&self.update_attribute)));
        writer.write_static("=\"");
        writer.write(TextChunk::Int(component.index() as i64));
        writer.write_static("\">");
        tree.render(component, writer)?;
        writer.write_static("</template>");
        Ok(())
    }
}

async fn close<T: ResponseTransport>(mut writer: PagedTextWriter<T>) -> Result<(u64, T)> {
    writer.flush().await?;
    writer.sink_mut().await?;
    let bytes = writer.bytes_flushed();
    Ok((bytes, writer.finish().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ComponentDescriptor;
    use crate::navigation::NavigationRequest;
    use crate::transport::MemoryTransport;
    use tokio::sync::oneshot;

    fn coordinator() -> RenderCoordinator {
        let config = RenderConfig {
            base_origin: "https://app.example".to_string(),
            redirect_key: Some("k".to_string()),
            ..RenderConfig::default()
        };
        RenderCoordinator::from_config(&config).unwrap()
    }

    fn text_frames(tree: &RenderTree, tag: &str, text: &str) -> Vec<crate::frame::RenderFrame> {
        let mut b = tree.frame_builder();
        b.open_element(tag).text(text).close();
        b.build().unwrap()
    }

    #[tokio::test]
    async fn test_quiescent_render_is_one_write() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "h1", "hello");
        tree.set_frames(root, frames).unwrap();

        let (outcome, transport) = coordinator()
            .render(&mut tree, root, MemoryTransport::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RenderOutcome::Completed {
                bytes: 14,
                streamed: false
            }
        );
        assert_eq!(transport.write_count(), 1);
        assert!(!transport.is_streaming());
        assert_eq!(transport.body_string(), "<h1>hello</h1>");
    }

    #[tokio::test]
    async fn test_pending_work_switches_to_streaming() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let list = tree.attach(ComponentDescriptor::new("List"), Some(root)).unwrap();
        let mut b = tree.frame_builder();
        b.open_element("main").component(list).close();
        let frames = b.build().unwrap();
        tree.set_frames(root, frames).unwrap();
        let frames = text_frames(&tree, "p", "loading");
        tree.set_frames(list, frames).unwrap();

        let loaded = text_frames(&tree, "p", "loaded");
        let (tx, rx) = oneshot::channel::<()>();
        tree.spawn_work(list, async move {
            let _ = rx.await;
            WorkOutcome::update(list, loaded)
        });

        let coordinator = coordinator();
        let render =
            coordinator.render(&mut tree, root, MemoryTransport::new(), CancellationToken::new());
        let release = async {
            tokio::task::yield_now().await;
            let _ = tx.send(());
        };
        let (result, ()) = tokio::join!(render, release);
        let (outcome, transport) = result.unwrap();

        assert!(matches!(outcome, RenderOutcome::Completed { streamed: true, .. }));
        assert!(transport.is_streaming());
        assert_eq!(transport.write_count(), 2);
        assert_eq!(
            transport.body_string(),
            format!(
                "<main><p>loading</p></main><template data-update=\"{}\"><p>loaded</p></template>",
                list.index()
            )
        );
    }

    #[tokio::test]
    async fn test_finished_work_is_folded_into_one_write() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "p", "loading");
        tree.set_frames(root, frames).unwrap();
        let loaded = text_frames(&tree, "p", "loaded");
        tree.spawn_work(root, async move { WorkOutcome::update(root, loaded) });

        let (outcome, transport) = coordinator()
            .render(&mut tree, root, MemoryTransport::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, RenderOutcome::Completed { streamed: false, .. }));
        assert!(!transport.is_streaming());
        assert_eq!(transport.write_count(), 1);
        assert_eq!(transport.body_string(), "<p>loaded</p>");
    }

    #[tokio::test]
    async fn test_finished_work_navigation_redirects() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "p", "never sent");
        tree.set_frames(root, frames).unwrap();
        tree.spawn_work(root, async { WorkOutcome::navigate(NavigationRequest::new("/login")) });

        let (outcome, transport) = coordinator()
            .render(&mut tree, root, MemoryTransport::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RenderOutcome::Redirect(Redirect::Location {
                location: "/login".to_string(),
                replace: false
            })
        );
        assert!(transport.body().is_empty());
    }

    #[tokio::test]
    async fn test_work_of_disposed_sibling_is_dropped() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let a = tree.attach(ComponentDescriptor::new("A"), Some(root)).unwrap();
        let b = tree.attach(ComponentDescriptor::new("B"), Some(root)).unwrap();
        let mut f = tree.frame_builder();
        f.open_element("main").component(a).component(b).close();
        let frames = f.build().unwrap();
        tree.set_frames(root, frames).unwrap();
        let frames = text_frames(&tree, "p", "a");
        tree.set_frames(a, frames).unwrap();
        let frames = text_frames(&tree, "p", "b");
        tree.set_frames(b, frames).unwrap();

        let a_done = text_frames(&tree, "p", "a done");
        let b_done = text_frames(&tree, "p", "b done");
        let (release_a, wait_a) = oneshot::channel::<()>();
        let (release_b, wait_b) = oneshot::channel::<()>();
        // A finishes first, disposes B and only then lets B finish.
        tree.spawn_work(a, async move {
            let _ = wait_a.await;
            let _ = release_b.send(());
            let mut outcome = WorkOutcome::update(a, a_done);
            outcome.batch.disposed.push(b);
            outcome
        });
        tree.spawn_work(b, async move {
            let _ = wait_b.await;
            WorkOutcome::update(b, b_done)
        });

        let coordinator = coordinator();
        let render =
            coordinator.render(&mut tree, root, MemoryTransport::new(), CancellationToken::new());
        let release = async {
            tokio::task::yield_now().await;
            let _ = release_a.send(());
        };
        let (result, ()) = tokio::join!(render, release);
        let (outcome, transport) = result.unwrap();

        assert!(matches!(outcome, RenderOutcome::Completed { streamed: true, .. }));
        assert_eq!(
            transport.body_string(),
            format!(
                "<main><p>a</p><p>b</p></main><template data-update=\"{}\"><p>a done</p></template>",
                a.index()
            )
        );
        assert!(!tree.arena().contains(b));
    }

    #[tokio::test]
    async fn test_navigation_before_output_redirects() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "p", "never sent");
        tree.set_frames(root, frames).unwrap();
        tree.request_navigation(NavigationRequest::new("/login").replace());

        let (outcome, transport) = coordinator()
            .render(&mut tree, root, MemoryTransport::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RenderOutcome::Redirect(Redirect::Location {
                location: "/login".to_string(),
                replace: true
            })
        );
        assert!(transport.body().is_empty());
    }

    #[tokio::test]
    async fn test_navigation_after_streaming_started_is_fatal() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "p", "partial");
        tree.set_frames(root, frames).unwrap();
        tree.spawn_work(root, async {
            tokio::task::yield_now().await;
            WorkOutcome::navigate(NavigationRequest::new("/elsewhere"))
        });

        let err = coordinator()
            .render(&mut tree, root, MemoryTransport::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::NavigationAfterCommit { location } if location == "/elsewhere"
        ));
    }

    #[tokio::test]
    async fn test_cancellation_stops_streaming() {
        let mut tree = RenderTree::new(Default::default());
        let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
        let frames = text_frames(&tree, "p", "x");
        tree.set_frames(root, frames).unwrap();
        tree.spawn_work(root, futures::future::pending());

        let cancel = CancellationToken::new();
        let coordinator = coordinator();
        let render = coordinator.render(&mut tree, root, MemoryTransport::new(), cancel.clone());
        let stop = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(render, stop);
        assert!(matches!(result, Err(RenderError::Cancelled)));
    }
}
