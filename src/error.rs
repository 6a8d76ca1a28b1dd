//! Error types for the rendering backends

use serde::Serialize;
use thiserror::Error;

/// Result type alias for renderer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by renderer construction and by the per-call render steps.
///
/// Only `Configuration` (and `NotConfigured`) ever leave a constructor as an
/// `Err`. Everything that goes wrong inside `render` is folded into a failed
/// [`RenderResult`](crate::RenderResult) instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine name, missing backend, failed launch or liveness check
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Engine-level failure while loading, evaluating or waiting
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// Navigation, selector wait or the whole render exceeded its bound
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Remote rendering service unreachable or connection dropped
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote rendering service answered with a non-200 status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Component switched off by settings; callers skip it
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

/// Coarse classification of a failed render, carried on the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Navigation,
    Timeout,
    Transport,
    Http,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::NotConfigured(_) => ErrorKind::Configuration,
            Error::Navigation(_) => ErrorKind::Navigation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Http { .. } => ErrorKind::Http,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    fn detail(&self) -> &str {
        match self {
            Error::Configuration(s)
            | Error::Navigation(s)
            | Error::Timeout(s)
            | Error::Transport(s)
            | Error::NotConfigured(s) => s,
            Error::Http { body, .. } => body,
        }
    }

    /// Human-readable message stored in `RenderResult::error`.
    ///
    /// The prefix identifies the failure tier so log lines can be grepped.
    pub fn render_message(&self, backend: &str, url: &str) -> String {
        match self {
            Error::Timeout(d) => format!("Timeout rendering URL {}: {}", url, d),
            Error::Transport(d) => format!("Error connecting to {}: {}", backend, d),
            Error::Http { status, body } => format!("{} returned HTTP {}: {}", backend, status, body),
            Error::Navigation(d) => format!("{} error rendering URL {}: {}", backend, url, d),
            other => format!("Error rendering URL {}: {}", url, other.detail()),
        }
    }
}
