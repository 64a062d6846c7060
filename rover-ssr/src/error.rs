use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// More than one live (component, handler) pair claims the same fingerprint.
    #[error(
        "ambiguous handler binding for fingerprint {fingerprint:08x}: bound by {}",
        components.join(", ")
    )]
    AmbiguousCorrelation {
        fingerprint: u32,
        components: Vec<String>,
    },

    #[error("no live handler is bound to fingerprint {0:08x}")]
    UnknownFingerprint(u32),

    #[error("navigation to '{location}' requested after the response started streaming")]
    NavigationAfterCommit { location: String },

    #[error("render invariant violated: {0}")]
    Invariant(String),

    #[error("output sink error: {0}")]
    Io(#[from] std::io::Error),

    #[error("render cancelled")]
    Cancelled,

    #[error("flush task failed: {0}")]
    FlushTask(String),

    #[error("render dispatcher is no longer running")]
    DispatcherClosed,
}

impl RenderError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("{}", message);
        Self::Invariant(message)
    }

    /// Only a stale or unknown fingerprint may be turned into a bad request.
    /// Everything else aborts the render.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnknownFingerprint(_))
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
