//! KaTeX Worker Library
//!
//! Server-side math rendering for static site builds. KaTeX runs in a
//! long-lived node process; this crate supervises that process and talks to
//! it over a framed socket protocol.
//!
//! - `gateway` - `RenderGateway`, the one call document adapters make
//! - `ipc` - worker process supervision, transport and framing
//! - `config` - host settings (`KATEX_*` keys)
//! - `models` - request/response wire types
//!
//! # Usage
//!
//! ```ignore
//! use katex_worker::{KatexSettings, RenderGateway};
//! use serde_json::json;
//!
//! let settings = KatexSettings::from_json(json!({"KATEX_RENDER_TIMEOUT": 2.0}))?;
//! let gateway = RenderGateway::new(&settings)?;
//!
//! let mut options = katex_worker::RenderOptions::new();
//! options.insert("displayMode".into(), json!(true));
//! let html = gateway.render_latex(r"\int_0^1 x\,dx", Some(&options)).await?;
//!
//! gateway.finish_document();
//! gateway.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod models;

pub use config::KatexSettings;
pub use error::{ConfigError, IpcError, KaTeXError, KaTeXErrorKind};
pub use gateway::{Preamble, RenderGateway};
pub use models::{RenderOptions, RenderRequest, RenderResponse};
