//! Error types for katex-worker.
//!
//! `IpcError` is the core taxonomy used by the transport, supervisor and
//! framing layers. `KaTeXError` is what collaborators see: every failure is
//! collapsed into one type carrying a human-readable message.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the worker process and its IPC channel.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The private runtime directory (or the worker script inside it) could not be created.
    #[error("Failed to prepare worker runtime directory: {0}")]
    TempDir(#[source] std::io::Error),

    /// The worker interpreter could not be launched.
    #[error("Failed to spawn worker `{binary}`: {source}")]
    Spawn {
        /// Interpreter that was executed
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker did not become connectable within the startup budget.
    #[error("Worker did not become ready within {}s", .0.as_secs_f64())]
    StartupTimeout(Duration),

    /// The worker exited before it became connectable.
    #[error("Worker exited during startup ({0})")]
    WorkerExited(ExitStatus),

    /// One request/response round trip exceeded its budget.
    #[error("Render request timed out after {}s", .0.as_secs_f64())]
    RenderTimeout(Duration),

    /// The response decoded but carries neither `html` nor `error`.
    #[error("Malformed worker response: {0}")]
    MalformedResponse(String),

    /// A frame declared a negative length or one above `MAX_FRAME_SIZE`.
    #[error("Frame length {0} is out of bounds")]
    FrameTooLarge(i64),

    /// The worker closed the connection mid-frame or the channel was already stopped.
    #[error("Connection closed by worker")]
    ConnectionClosed,

    /// Request serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => IpcError::ConnectionClosed,
            _ => IpcError::Io(err),
        }
    }
}

/// Invalid host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings object did not deserialize.
    #[error("Invalid KaTeX settings: {0}")]
    Json(#[from] serde_json::Error),

    /// A timeout was negative, NaN or infinite.
    #[error("{key} must be a finite, non-negative number of seconds, got {value}")]
    InvalidTimeout {
        /// Settings key holding the bad value
        key: &'static str,
        /// The rejected value
        value: f64,
    },
}

/// Coarse classification of a [`KaTeXError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KaTeXErrorKind {
    /// KaTeX rejected the input (e.g. an undefined control sequence).
    Worker,
    /// The render round trip exceeded `KATEX_RENDER_TIMEOUT`.
    RenderTimeout,
    /// The worker did not come up within `KATEX_STARTUP_TIMEOUT`.
    StartupTimeout,
    /// The worker answered with something that is not a valid response frame.
    Protocol,
    /// The worker could not be launched or the connection failed.
    Unavailable,
}

impl fmt::Display for KaTeXErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KaTeXErrorKind::Worker => "worker",
            KaTeXErrorKind::RenderTimeout => "render timeout",
            KaTeXErrorKind::StartupTimeout => "startup timeout",
            KaTeXErrorKind::Protocol => "protocol",
            KaTeXErrorKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// The single error type returned by [`crate::RenderGateway::render_latex`].
///
/// `Display` is the bare message, so a worker-reported error reads exactly
/// as KaTeX produced it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct KaTeXError {
    kind: KaTeXErrorKind,
    message: String,
}

impl KaTeXError {
    pub fn new(kind: KaTeXErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error reported by KaTeX itself.
    pub fn worker(message: impl Into<String>) -> Self {
        Self::new(KaTeXErrorKind::Worker, message)
    }

    pub fn kind(&self) -> KaTeXErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Map a failure to obtain the worker.
    pub(crate) fn from_startup(err: IpcError) -> Self {
        match err {
            IpcError::StartupTimeout(timeout) => Self::new(
                KaTeXErrorKind::StartupTimeout,
                format!(
                    "KaTeX server did not start within {}s. \
                     Consider increasing KATEX_STARTUP_TIMEOUT.",
                    timeout.as_secs_f64()
                ),
            ),
            other => Self::new(KaTeXErrorKind::Unavailable, other.to_string()),
        }
    }

    /// Map a failed round trip for `latex`.
    pub(crate) fn from_render(latex: &str, err: IpcError) -> Self {
        match err {
            IpcError::RenderTimeout(timeout) => Self::new(
                KaTeXErrorKind::RenderTimeout,
                format!(
                    "Rendering {:?} timed out after {}s. \
                     Consider increasing KATEX_RENDER_TIMEOUT.",
                    latex,
                    timeout.as_secs_f64()
                ),
            ),
            err @ (IpcError::MalformedResponse(_)
            | IpcError::FrameTooLarge(_)
            | IpcError::ConnectionClosed
            | IpcError::Json(_)) => Self::new(KaTeXErrorKind::Protocol, err.to_string()),
            other => Self::new(KaTeXErrorKind::Unavailable, other.to_string()),
        }
    }
}
