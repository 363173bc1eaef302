//! Error types for Flick Core

use crate::types::SlotId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for feed and playback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Origin of a stream failure as reported by the media pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Manifest, segment or source transfer failed
    Network,
    /// Decoder or demuxer failure
    Media,
    /// Source format or codec the platform cannot play
    Unsupported,
    /// Anything the pipeline could not classify
    Other,
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamErrorKind::Network => write!(f, "network"),
            StreamErrorKind::Media => write!(f, "media"),
            StreamErrorKind::Unsupported => write!(f, "unsupported"),
            StreamErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Whether an engine can keep going after a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Retried locally inside the engine
    Recoverable,
    /// The engine has torn itself down
    Fatal,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Recoverable => write!(f, "recoverable"),
            ErrorSeverity::Fatal => write!(f, "fatal"),
        }
    }
}

/// A stream error after the engine has classified it
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{severity} {kind} stream error: {details}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub severity: ErrorSeverity,
    pub details: String,
}

impl StreamError {
    pub fn recoverable(kind: StreamErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            severity: ErrorSeverity::Recoverable,
            details: details.into(),
        }
    }

    pub fn fatal(kind: StreamErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            severity: ErrorSeverity::Fatal,
            details: details.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }

    /// Stable code used in analytics records
    pub fn code(&self) -> &'static str {
        match (self.kind, self.severity) {
            (StreamErrorKind::Network, ErrorSeverity::Recoverable) => "STREAM_NETWORK_RETRY",
            (StreamErrorKind::Network, ErrorSeverity::Fatal) => "STREAM_NETWORK_FATAL",
            (StreamErrorKind::Media, ErrorSeverity::Recoverable) => "STREAM_MEDIA_RECOVER",
            (StreamErrorKind::Media, ErrorSeverity::Fatal) => "STREAM_MEDIA_FATAL",
            (StreamErrorKind::Unsupported, _) => "STREAM_UNSUPPORTED",
            (StreamErrorKind::Other, ErrorSeverity::Recoverable) => "STREAM_OTHER",
            (StreamErrorKind::Other, ErrorSeverity::Fatal) => "STREAM_OTHER_FATAL",
        }
    }
}

/// Feed and playback error types
#[derive(Error, Debug)]
pub enum Error {
    // Manifest errors
    #[error("Failed to fetch manifest: {0}")]
    ManifestFetch(String),

    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    // Stream errors
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Quality level {index} out of range ({available} levels)")]
    InvalidQuality { index: usize, available: usize },

    // Playback errors
    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No playback session attached to slot {0}")]
    NoSession(SlotId),

    // Pool errors
    #[error("Unknown engine slot: {0}")]
    UnknownSlot(SlotId),

    #[error("Feed index {index} out of range (feed length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    // Scheduling errors
    #[error("Preload fetch failed for {url}: {reason}")]
    PreloadFetch { url: String, reason: String },

    // Network errors
    #[cfg(feature = "http")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a preload error
    pub fn preload(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PreloadFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Stream(e) => !e.is_fatal(),
            Error::ManifestFetch(_) | Error::PreloadFetch { .. } => true,
            #[cfg(feature = "http")]
            Error::Network(_) => true,
            _ => false,
        }
    }

    /// Returns the error code for analytics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ManifestFetch(_) => "MANIFEST_FETCH",
            Error::ManifestParse(_) => "MANIFEST_PARSE",
            Error::Stream(e) => e.code(),
            Error::InvalidQuality { .. } => "INVALID_QUALITY",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::NoSession(_) => "NO_SESSION",
            Error::UnknownSlot(_) => "UNKNOWN_SLOT",
            Error::IndexOutOfRange { .. } => "INDEX_RANGE",
            Error::PreloadFetch { .. } => "PRELOAD_FETCH",
            #[cfg(feature = "http")]
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "JSON",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }
}
