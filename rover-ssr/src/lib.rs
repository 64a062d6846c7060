pub mod arena;
pub mod buffer;
pub mod config;
pub mod conventions;
pub mod coordinator;
pub mod correlation;
pub mod dispatcher;
mod encoder;
pub mod error;
pub mod frame;
pub mod navigation;
pub mod transport;
pub mod tree;
pub mod walker;

pub use arena::{ComponentDescriptor, ComponentStateArena, OutputCondition, OutputMode, RequestScope};
pub use buffer::{ConditionalWriter, PagedTextWriter, TextChunk, TextSink};
pub use config::RenderConfig;
pub use conventions::{ActionConventions, ActionKind};
pub use coordinator::{Quiescence, RenderCoordinator, RenderOutcome};
pub use correlation::{HandlerBinding, HandlerCorrelationTable, fingerprint};
pub use dispatcher::{DispatchOutcome, RenderDispatcher, RenderRequest, Renderer, parse_fingerprint};
pub use encoder::TextEncoder;
pub use error::{RenderError, Result};
pub use frame::{AttributeValue, ComponentId, EventId, FrameBuilder, HandlerId, RenderFrame};
pub use navigation::{NavigationOptions, NavigationRequest, Redirect, RedirectPolicy, RedirectProtector};
pub use transport::{MemoryTransport, ResponseTransport};
pub use tree::{ComponentUpdate, HandlerContext, RenderBatch, RenderTree, WorkOutcome};
pub use walker::{FrameSource, HtmlWalker, WalkSummary};
