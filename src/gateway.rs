//! Render gateway: the entry point document adapters call.
//!
//! One gateway owns one worker slot. It is built once by the host and shared
//! by reference (or `Arc`) with every caller. Calls are serialised on the
//! worker slot, so concurrent callers never interleave frames and concurrent
//! first callers start exactly one worker.

use std::borrow::Cow;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::KatexSettings;
use crate::error::{ConfigError, KaTeXError};
use crate::ipc::{WorkerCommand, WorkerSupervisor};
use crate::models::{RenderOptions, RenderRequest, RenderResponse};

/// Global and document-local preamble definitions.
///
/// The effective preamble (global first, then local additions in push
/// order, newline-separated) is prepended to every formula.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preamble {
    global: Option<String>,
    local: Vec<String>,
}

impl Preamble {
    pub fn new(global: Option<String>) -> Self {
        Self {
            global,
            local: Vec::new(),
        }
    }

    pub fn push(&mut self, definitions: impl Into<String>) {
        self.local.push(definitions.into());
    }

    /// Drop document-local definitions; the global preamble stays.
    pub fn reset(&mut self) {
        self.local.clear();
    }

    pub fn effective(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .global
            .iter()
            .chain(self.local.iter())
            .map(String::as_str)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// `latex` with the effective preamble in front of it.
    pub fn apply<'a>(&self, latex: &'a str) -> Cow<'a, str> {
        match self.effective() {
            Some(preamble) => Cow::Owned(format!("{}\n{}", preamble, latex)),
            None => Cow::Borrowed(latex),
        }
    }
}

/// Collaborator-facing render service.
///
/// # Example
///
/// ```ignore
/// let gateway = RenderGateway::new(&KatexSettings::default())?;
/// let html = gateway.render_latex("x^2", None).await?;
/// gateway.shutdown().await;
/// ```
#[derive(Debug)]
pub struct RenderGateway {
    supervisor: Mutex<WorkerSupervisor>,
    default_options: RenderOptions,
    render_timeout: Option<Duration>,
    preamble: StdMutex<Preamble>,
}

impl RenderGateway {
    /// Build a gateway from host settings. No process is started yet.
    pub fn new(settings: &KatexSettings) -> Result<Self, ConfigError> {
        Ok(Self::from_parts(
            settings.worker_command(),
            settings.startup_timeout()?,
            settings.render_timeout()?,
            settings.default_options(),
            Preamble::new(settings.preamble.clone()),
        ))
    }

    pub fn from_parts(
        command: WorkerCommand,
        startup_timeout: Duration,
        render_timeout: Option<Duration>,
        default_options: RenderOptions,
        preamble: Preamble,
    ) -> Self {
        Self {
            supervisor: Mutex::new(WorkerSupervisor::new(command, startup_timeout)),
            default_options,
            render_timeout,
            preamble: StdMutex::new(preamble),
        }
    }

    /// Render `latex` to HTML markup.
    ///
    /// `options` are merged over the gateway defaults for this call only.
    /// The returned markup is final and must not be processed further.
    ///
    /// # Errors
    ///
    /// Any failure surfaces as a [`KaTeXError`]; see its kind for the cause.
    /// After a timeout or protocol failure the worker is discarded and the
    /// next call starts a fresh one.
    pub async fn render_latex(
        &self,
        latex: &str,
        options: Option<&RenderOptions>,
    ) -> Result<String, KaTeXError> {
        let request = RenderRequest::new(
            self.lock_preamble().apply(latex),
            self.merged_options(options),
        );

        let mut supervisor = self.supervisor.lock().await;
        let worker = supervisor
            .get_or_start()
            .await
            .map_err(KaTeXError::from_startup)?;

        match worker.render(&request, self.render_timeout).await {
            Ok(RenderResponse::Html(html)) => Ok(html),
            Ok(RenderResponse::Error(message)) => {
                debug!("KaTeX rejected {:?}: {}", latex, message);
                Err(KaTeXError::worker(message))
            }
            Err(err) => {
                // The frame boundary is unknown now; never reuse this channel.
                warn!("Discarding KaTeX worker after failed render: {}", err);
                supervisor.discard();
                Err(KaTeXError::from_render(latex, err))
            }
        }
    }

    /// Defaults overlaid with `overrides`; the defaults themselves are untouched.
    pub fn merged_options(&self, overrides: Option<&RenderOptions>) -> RenderOptions {
        let mut options = self.default_options.clone();
        if let Some(overrides) = overrides {
            options.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }

    pub fn default_options(&self) -> &RenderOptions {
        &self.default_options
    }

    pub fn render_timeout(&self) -> Option<Duration> {
        self.render_timeout
    }

    /// Add document-local preamble definitions.
    pub fn push_preamble(&self, definitions: impl Into<String>) {
        self.lock_preamble().push(definitions);
    }

    pub fn preamble(&self) -> Option<String> {
        self.lock_preamble().effective()
    }

    /// Per-document teardown: forget document-local preamble definitions.
    pub fn finish_document(&self) {
        self.lock_preamble().reset();
    }

    /// Whether a worker is currently held.
    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.is_running()
    }

    /// Worker pid, if one is running.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.supervisor
            .lock()
            .await
            .current()
            .and_then(|worker| worker.pid())
    }

    /// Stop the worker and remove its runtime directory.
    ///
    /// Idempotent; a later render starts a new worker. Dropping the gateway
    /// without calling this still kills the process and removes the
    /// directory, but without the graceful-termination grace period.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.stop().await;
    }

    fn lock_preamble(&self) -> MutexGuard<'_, Preamble> {
        self.preamble.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KaTeXErrorKind;
    use crate::models::base_options;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn gateway(command: WorkerCommand) -> RenderGateway {
        RenderGateway::from_parts(
            command,
            Duration::from_millis(200),
            Some(Duration::from_millis(200)),
            base_options(),
            Preamble::default(),
        )
    }

    #[test]
    fn test_preamble_joins_global_and_local() {
        let mut preamble = Preamble::new(Some(r"\def\R{\mathbb{R}}".to_string()));
        preamble.push(r"\def\N{\mathbb{N}}");
        preamble.push(r"\def\Z{\mathbb{Z}}");

        assert_eq!(
            preamble.effective().as_deref(),
            Some("\\def\\R{\\mathbb{R}}\n\\def\\N{\\mathbb{N}}\n\\def\\Z{\\mathbb{Z}}")
        );

        preamble.reset();
        assert_eq!(preamble.effective().as_deref(), Some(r"\def\R{\mathbb{R}}"));
    }

    #[test]
    fn test_preamble_apply() {
        let empty = Preamble::default();
        assert!(matches!(empty.apply("x^2"), Cow::Borrowed("x^2")));

        let mut local = Preamble::default();
        local.push(r"\def\x{y}");
        assert_eq!(local.apply("x^2"), "\\def\\x{y}\nx^2");
    }

    #[test]
    fn test_merge_does_not_mutate_defaults() {
        let gateway = gateway(WorkerCommand::default());

        let mut overrides = RenderOptions::new();
        overrides.insert("displayMode".to_string(), json!(true));
        overrides.insert("throwOnError".to_string(), json!(true));

        let merged = gateway.merged_options(Some(&overrides));
        assert_eq!(merged.get("displayMode"), Some(&json!(true)));
        assert_eq!(merged.get("throwOnError"), Some(&json!(true)));

        assert_eq!(gateway.default_options(), &base_options());
        assert_eq!(gateway.merged_options(None), base_options());
    }

    #[test]
    fn test_gateway_preamble_lifecycle() {
        let settings = KatexSettings {
            preamble: Some(r"\def\R{\mathbb{R}}".to_string()),
            ..Default::default()
        };
        let gateway = RenderGateway::new(&settings).expect("valid settings");

        gateway.push_preamble(r"\def\N{\mathbb{N}}");
        assert_eq!(
            gateway.preamble().as_deref(),
            Some("\\def\\R{\\mathbb{R}}\n\\def\\N{\\mathbb{N}}")
        );

        gateway.finish_document();
        assert_eq!(gateway.preamble().as_deref(), Some(r"\def\R{\mathbb{R}}"));
    }

    #[test]
    fn test_new_rejects_invalid_timeout() {
        let settings = KatexSettings {
            render_timeout: Some(f64::NAN),
            ..Default::default()
        };
        assert!(RenderGateway::new(&settings).is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_as_katex_error() {
        let gateway = gateway(WorkerCommand {
            interpreter: "/nonexistent/binary/that/does/not/exist".to_string(),
            ..WorkerCommand::default()
        });

        let err = gateway.render_latex("x^2", None).await.unwrap_err();
        assert_eq!(err.kind(), KaTeXErrorKind::Unavailable);
        assert!(!gateway.is_running().await);
    }

    #[tokio::test]
    async fn test_shutdown_without_worker_is_noop() {
        let gateway = gateway(WorkerCommand::default());
        gateway.shutdown().await;
        gateway.shutdown().await;
        assert_eq!(gateway.worker_pid().await, None);
    }
}
