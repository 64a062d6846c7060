use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RenderConfig;
use crate::coordinator::{RenderCoordinator, RenderOutcome};
use crate::correlation::HandlerBinding;
use crate::error::{RenderError, Result};
use crate::frame::ComponentId;
use crate::navigation::Redirect;
use crate::transport::ResponseTransport;
use crate::tree::RenderTree;

const DEFAULT_QUEUE_DEPTH: usize = 64;

/// What the request-dispatch layer hands the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub root: ComponentId,
    /// Echoed back by the client from the fingerprint attribute.
    pub fingerprint: Option<u32>,
    pub fragment: bool,
}

impl RenderRequest {
    pub fn page(root: ComponentId) -> Self {
        Self {
            root,
            fingerprint: None,
            fragment: false,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: u32) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn fragment(mut self) -> Self {
        self.fragment = true;
        self
    }
}

/// Reads a fingerprint as written by the walker (decimal).
pub fn parse_fingerprint(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Rendered {
        bytes: u64,
        streamed: bool,
        handler: Option<HandlerBinding>,
    },
    Redirect(Redirect),
    /// The fingerprint matched no live handler.
    BadRequest { fingerprint: u32 },
}

/// One component tree and the coordinator that renders it.
pub struct Renderer {
    tree: RenderTree,
    coordinator: RenderCoordinator,
}

impl Renderer {
    pub fn new(tree: RenderTree, coordinator: RenderCoordinator) -> Self {
        Self { tree, coordinator }
    }

    pub fn from_config(config: &RenderConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            RenderTree::from_config(config),
            RenderCoordinator::from_config(config)?,
        ))
    }

    pub fn tree(&self) -> &RenderTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RenderTree {
        &mut self.tree
    }

    pub fn coordinator(&self) -> &RenderCoordinator {
        &self.coordinator
    }

    /// Runs the correlated handler, if any, then renders. Only an unknown
    /// fingerprint becomes `BadRequest`; every other error aborts.
    pub async fn handle<T: ResponseTransport>(
        &mut self,
        request: RenderRequest,
        transport: T,
        cancel: CancellationToken,
    ) -> Result<(DispatchOutcome, T)> {
        let mut handler = None;
        if let Some(fingerprint) = request.fingerprint {
            match self.tree.dispatch(fingerprint) {
                Ok(binding) => handler = Some(binding),
                Err(err) if err.is_recoverable() => {
                    warn!("bad request: {}", err);
                    return Ok((DispatchOutcome::BadRequest { fingerprint }, transport));
                }
                Err(err) => return Err(err),
            }
        }

        self.tree.scope().set_fragment(request.fragment);
        let result = self
            .coordinator
            .render(&mut self.tree, request.root, transport, cancel)
            .await;
        self.tree.scope().set_fragment(false);

        let (outcome, transport) = result?;
        let outcome = match outcome {
            RenderOutcome::Completed { bytes, streamed } => DispatchOutcome::Rendered {
                bytes,
                streamed,
                handler,
            },
            RenderOutcome::Redirect(redirect) => DispatchOutcome::Redirect(redirect),
        };
        Ok((outcome, transport))
    }
}

type Invocation = Box<dyn FnOnce(&mut Renderer) + Send>;

enum Job<T> {
    Invoke(Invocation),
    Handle {
        request: RenderRequest,
        transport: T,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<(DispatchOutcome, T)>>,
    },
}

/// Owns a `Renderer` on its own task. Every call is queued and runs in
/// arrival order, so the tree is only ever touched from that task.
pub struct RenderDispatcher<T> {
    jobs: mpsc::Sender<Job<T>>,
    task: JoinHandle<Renderer>,
}

impl<T: ResponseTransport> RenderDispatcher<T> {
    pub fn spawn(renderer: Renderer) -> Self {
        Self::with_queue_depth(renderer, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(renderer: Renderer, depth: usize) -> Self {
        let (jobs, mut queue) = mpsc::channel::<Job<T>>(depth.max(1));
        let task = tokio::spawn(async move {
            let mut renderer = renderer;
            let mut handled = 0u64;
            while let Some(job) = queue.recv().await {
                match job {
                    Job::Invoke(f) => f(&mut renderer),
                    Job::Handle {
                        request,
                        transport,
                        cancel,
                        reply,
                    } => {
                        let result = renderer.handle(request, transport, cancel).await;
                        handled += 1;
                        if reply.send(result).is_err() {
                            debug!("caller went away before render of {} finished", request.root);
                        }
                    }
                }
            }
            info!("render dispatcher stopped after {} requests", handled);
            renderer
        });
        Self { jobs, task }
    }

    /// Runs `f` against the renderer on the dispatcher task.
    pub async fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Renderer) -> R + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job = Job::Invoke(Box::new(move |renderer: &mut Renderer| {
            let _ = reply.send(f(renderer));
        }));
        self.jobs
            .send(job)
            .await
            .map_err(|_| RenderError::DispatcherClosed)?;
        response.await.map_err(|_| RenderError::DispatcherClosed)
    }

    pub async fn handle(
        &self,
        request: RenderRequest,
        transport: T,
        cancel: CancellationToken,
    ) -> Result<(DispatchOutcome, T)> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job::Handle {
                request,
                transport,
                cancel,
                reply,
            })
            .await
            .map_err(|_| RenderError::DispatcherClosed)?;
        response.await.map_err(|_| RenderError::DispatcherClosed)?
    }

    /// Stops accepting work, drains the queue and returns the renderer.
    pub async fn shutdown(self) -> Result<Renderer> {
        drop(self.jobs);
        self.task
            .await
            .map_err(|e| RenderError::FlushTask(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ComponentDescriptor;
    use crate::transport::MemoryTransport;

    fn renderer() -> Renderer {
        Renderer::from_config(&RenderConfig {
            redirect_key: Some("k".to_string()),
            ..RenderConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_fingerprint() {
        assert_eq!(parse_fingerprint(" 4294967295 "), Some(u32::MAX));
        assert_eq!(parse_fingerprint("abc"), None);
        assert_eq!(parse_fingerprint("-1"), None);
    }

    #[tokio::test]
    async fn test_unknown_fingerprint_is_bad_request() {
        let mut renderer = renderer();
        let root = renderer
            .tree_mut()
            .attach(ComponentDescriptor::new("App"), None)
            .unwrap();

        let (outcome, transport) = renderer
            .handle(
                RenderRequest::page(root).with_fingerprint(7),
                MemoryTransport::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::BadRequest { fingerprint: 7 });
        assert!(transport.body().is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_serializes_calls_onto_one_task() {
        let dispatcher: RenderDispatcher<MemoryTransport> = RenderDispatcher::spawn(renderer());
        let root = dispatcher
            .invoke(|r| {
                let tree = r.tree_mut();
                let root = tree.attach(ComponentDescriptor::new("App"), None)?;
                let mut b = tree.frame_builder();
                b.open_element("p").text("hi").close();
                let frames = b.build()?;
                tree.set_frames(root, frames)?;
                Ok::<_, RenderError>(root)
            })
            .await
            .unwrap()
            .unwrap();

        let (outcome, transport) = dispatcher
            .handle(
                RenderRequest::page(root),
                MemoryTransport::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Rendered { streamed: false, .. }));
        assert_eq!(transport.body_string(), "<p>hi</p>");

        let renderer = dispatcher.shutdown().await.unwrap();
        assert!(renderer.tree().arena().contains(root));
    }
}
