//! Wire models exchanged with the KaTeX worker.
//!
//! Request and response bodies are JSON objects carried inside
//! length-prefixed frames (see [`crate::ipc::framing`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IpcError;

/// KaTeX options: option name to scalar/bool value (`displayMode`, `throwOnError`, ...).
pub type RenderOptions = serde_json::Map<String, Value>;

/// Options every render starts from before host and caller overrides.
///
/// `throwOnError: false` makes KaTeX render malformed math with its error
/// styling instead of failing the whole build.
pub fn base_options() -> RenderOptions {
    let mut options = RenderOptions::new();
    options.insert("throwOnError".to_string(), Value::Bool(false));
    options
}

/// A single render request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRequest {
    /// Math source text. The field name is part of the worker protocol.
    pub latex: String,
    pub katex_options: RenderOptions,
}

impl RenderRequest {
    pub fn new(latex: impl Into<String>, katex_options: RenderOptions) -> Self {
        Self {
            latex: latex.into(),
            katex_options,
        }
    }
}

/// The worker's answer to one [`RenderRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResponse {
    /// Rendered markup, to be embedded verbatim.
    Html(String),
    /// KaTeX rejected the input.
    Error(String),
}

/// Raw response body; exactly one field is expected to be set.
#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RenderResponse {
    /// Decode a response body.
    ///
    /// Anything that is not a UTF-8 JSON object carrying `html` or `error`
    /// is a protocol violation and yields [`IpcError::MalformedResponse`].
    pub fn decode(body: &[u8]) -> Result<Self, IpcError> {
        let parsed: ResponseBody = serde_json::from_slice(body)
            .map_err(|e| IpcError::MalformedResponse(format!("undecodable body: {}", e)))?;

        match parsed {
            ResponseBody {
                html: Some(html), ..
            } => Ok(RenderResponse::Html(html)),
            ResponseBody {
                error: Some(error),
                ..
            } => Ok(RenderResponse::Error(error)),
            _ => Err(IpcError::MalformedResponse(
                "response has neither `html` nor `error`".to_string(),
            )),
        }
    }
}
