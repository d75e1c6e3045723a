//! Error taxonomy for the download engine (spec §7).

use std::fmt;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The engine's error type. Each named variant corresponds to one of the
/// error kinds enumerated in §7; everything else that can go wrong (I/O,
/// JSON shape mismatches, third-party errors) is carried in `Internal` with
/// an `origin` string identifying where it came from, following the same
/// catch-all shape the teacher repo uses for its own `Error::Internal`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resolver error{}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Resolver { status: Option<u16> },

    #[error("resolver response could not be parsed: {0}")]
    ResolverParse(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("authentication failed (status {status})")]
    Auth { status: u16 },

    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("server does not support ranged requests")]
    RangeUnsupported,

    #[error("requested range not satisfiable (416)")]
    RangeOutOfBounds,

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("format verification failed: {0}")]
    VerifyFailed(String),

    #[error("operation canceled")]
    Canceled,

    /// Catch-all for internal/third-party errors not otherwise modeled,
    /// carrying an `origin` string for diagnostics (matches the teacher's
    /// `Error::Internal { error, origin }` pattern).
    #[error("internal error: {error} @ {origin}")]
    Internal {
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
        origin: Box<str>,
    },
}

impl Error {
    pub fn new_io(error: std::io::Error) -> Self {
        Self::Io(error)
    }

    pub fn internal(error: impl std::error::Error + Send + Sync + 'static, origin: impl Into<Box<str>>) -> Self {
        Self::Internal { error: Box::new(error), origin: origin.into() }
    }

    pub fn new_reqwest(error: reqwest::Error, origin: impl Into<Box<str>>) -> Self {
        if error.is_timeout() || error.is_connect() {
            Self::NetworkUnreachable(Box::new(error))
        } else {
            Self::internal(error, origin)
        }
    }

    pub fn new_rusqlite(error: rusqlite::Error, origin: impl Into<Box<str>>) -> Self {
        Self::internal(error, origin)
    }

    /// Classify whether this error is worth retrying at the worker level
    /// (§7: "network_unreachable, rate_limited, io_error(transient) are
    /// retried with exponential backoff + jitter").
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnreachable(_) | Self::RateLimited { .. } | Self::Io(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// A coarse-grained classification mirroring the `kind` enumeration in §7,
/// useful when callers want to `match` without digging into variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Resolver,
    NetworkUnreachable,
    Auth,
    RateLimited,
    RangeUnsupported,
    RangeOutOfBounds,
    Io,
    ChecksumMismatch,
    VerifyFailed,
    Canceled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Resolver { .. } | Self::ResolverParse(_) => ErrorKind::Resolver,
            Self::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::RangeUnsupported => ErrorKind::RangeUnsupported,
            Self::RangeOutOfBounds => ErrorKind::RangeOutOfBounds,
            Self::Io(_) => ErrorKind::Io,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::VerifyFailed(_) => ErrorKind::VerifyFailed,
            Self::Canceled => ErrorKind::Canceled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config_error",
            Self::Resolver => "resolver_error",
            Self::NetworkUnreachable => "network_unreachable",
            Self::Auth => "auth_error",
            Self::RateLimited => "rate_limited",
            Self::RangeUnsupported => "range_unsupported",
            Self::RangeOutOfBounds => "range_out_of_bounds",
            Self::Io => "io_error",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::VerifyFailed => "verify_failed",
            Self::Canceled => "canceled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}
