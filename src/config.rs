//! Host configuration for the KaTeX worker.
//!
//! Settings use the same keys as the host site generator's settings file
//! (`KATEX`, `KATEX_RENDER_TIMEOUT`, ...), so a host can hand its whole
//! settings object to [`KatexSettings::from_json`]; unknown keys are ignored.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ipc::{TransportKind, WorkerCommand};
use crate::models::{base_options, RenderOptions};

/// Interpreter used when neither the settings nor the environment name one.
pub const DEFAULT_NODEJS_BINARY: &str = "node";

/// Environment variable consulted when `KATEX_NODEJS_BINARY` is not configured.
pub const NODEJS_BINARY_ENV: &str = "KATEX_NODEJS_BINARY";

/// Worker and rendering configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KatexSettings {
    /// Option overrides merged over the base options.
    #[serde(rename = "KATEX")]
    pub options: RenderOptions,

    /// Alternate KaTeX installation, passed to the worker as `--katex-path`.
    #[serde(rename = "KATEX_PATH")]
    pub katex_path: Option<PathBuf>,

    /// Seconds to wait for the worker to become connectable.
    #[serde(rename = "KATEX_STARTUP_TIMEOUT")]
    pub startup_timeout: f64,

    /// Seconds allowed per render round trip; `None` waits forever.
    #[serde(rename = "KATEX_RENDER_TIMEOUT")]
    pub render_timeout: Option<f64>,

    #[serde(rename = "KATEX_NODEJS_BINARY")]
    pub nodejs_binary: Option<String>,

    /// Global preamble prepended to every formula.
    #[serde(rename = "KATEX_PREAMBLE")]
    pub preamble: Option<String>,

    /// Custom worker script instead of the bundled one.
    #[serde(rename = "KATEX_WORKER_SCRIPT")]
    pub worker_script: Option<PathBuf>,

    #[serde(rename = "KATEX_TRANSPORT")]
    pub transport: TransportKind,
}

impl Default for KatexSettings {
    fn default() -> Self {
        Self {
            options: RenderOptions::new(),
            katex_path: None,
            startup_timeout: 1.0,
            render_timeout: Some(1.0),
            nodejs_binary: None,
            preamble: None,
            worker_script: None,
            transport: TransportKind::Auto,
        }
    }
}

impl KatexSettings {
    /// Build settings from a host settings object and validate the timeouts.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_value(value)?;
        settings.startup_timeout()?;
        settings.render_timeout()?;
        Ok(settings)
    }

    pub fn startup_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("KATEX_STARTUP_TIMEOUT", self.startup_timeout)
    }

    pub fn render_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.render_timeout
            .map(|secs| seconds("KATEX_RENDER_TIMEOUT", secs))
            .transpose()
    }

    /// Interpreter binary: settings, then `$KATEX_NODEJS_BINARY`, then `node`.
    pub fn interpreter(&self) -> String {
        self.nodejs_binary
            .clone()
            .or_else(|| std::env::var(NODEJS_BINARY_ENV).ok())
            .unwrap_or_else(|| DEFAULT_NODEJS_BINARY.to_string())
    }

    /// Base options with the configured overrides applied.
    pub fn default_options(&self) -> RenderOptions {
        let mut options = base_options();
        options.extend(self.options.clone());
        options
    }

    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            interpreter: self.interpreter(),
            script: self.worker_script.clone(),
            katex_path: self.katex_path.clone(),
            transport: self.transport,
        }
    }
}

fn seconds(key: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidTimeout { key, value })
}
