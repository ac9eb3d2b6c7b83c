//! Error taxonomy
//!
//! Every failure produced by the transport, the identifier codec or the wait engine is
//! mapped once to an [`ErrorKind`]. Lifecycle handlers and the diagnostic layer only ever
//! branch on the kind, never on HTTP status codes or API-specific error shapes.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    PreconditionFailed,
    TooManyResults,
    TransientState,
    Timeout,
    InvalidArgument,
    Unavailable,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition-failed",
            Self::TooManyResults => "too-many-results",
            Self::TransientState => "transient-state",
            Self::Timeout => "timeout",
            Self::InvalidArgument => "invalid-argument",
            Self::Unavailable => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body returned by Scaleway APIs
///
/// Every field is optional: gateways in front of the APIs sometimes answer with an
/// empty or non-JSON body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub help_message: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ApiErrorBody {
    fn summary(&self) -> String {
        let mut out = self.message.clone().unwrap_or_default();
        if let Some(state) = &self.current_state {
            out.push_str(&format!(" (current state: {})", state));
        }
        if let Some(help) = &self.help_message {
            out.push_str(&format!(" - {}", help));
        }
        out
    }
}

/// A non-success HTTP answer from an API
#[derive(Debug, Clone, Error)]
#[error("{method} {url}: {status} {}", body.summary())]
pub struct ApiError {
    pub status: u16,
    pub method: String,
    pub url: String,
    pub body: ApiErrorBody,
}

impl ApiError {
    /// Classify the answer from its error type first, then its status code
    pub fn kind(&self) -> ErrorKind {
        match self.body.error_type.as_deref() {
            Some("not_found") | Some("NoSuchBucket") | Some("NoSuchKey") => {
                return ErrorKind::NotFound
            }
            Some("transient_state") => return ErrorKind::TransientState,
            Some("precondition_failed") => return ErrorKind::PreconditionFailed,
            Some("invalid_arguments") | Some("invalid_request_error") => {
                return ErrorKind::InvalidArgument
            }
            Some("permissions_denied") | Some("denied_authentication") | Some("AccessDenied") => {
                return ErrorKind::Forbidden
            }
            Some("conflict") | Some("already_exists") | Some("BucketAlreadyOwnedByYou") => {
                return ErrorKind::Conflict
            }
            _ => {}
        }

        match self.status {
            404 | 410 => ErrorKind::NotFound,
            401 | 403 => ErrorKind::Forbidden,
            409 => ErrorKind::Conflict,
            412 => ErrorKind::PreconditionFailed,
            400 | 422 => ErrorKind::InvalidArgument,
            429 | 500 | 502 | 503 | 504 => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Library error
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid locality {0:?}")]
    InvalidLocality(String),

    #[error("malformed identifier {0:?}")]
    MalformedIdentifier(String),

    #[error("{0} not found: set it on the resource or in the provider configuration")]
    LocalityNotFound(&'static str),

    #[error("state upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{count} {what} found matching {key:?}, expected exactly one")]
    TooManyResults {
        what: String,
        key: String,
        count: usize,
    },

    #[error("{what} is in transient state {status:?}")]
    TransientState { what: String, status: String },

    #[error("timeout waiting for {what} (last status: {})", last.as_deref().unwrap_or("unknown"))]
    Timeout { what: String, last: Option<String> },

    #[error("{what}: operation cancelled (last status: {})", last.as_deref().unwrap_or("unknown"))]
    Cancelled { what: String, last: Option<String> },

    #[error("{what} reached status {status:?}")]
    ErrorState { what: String, status: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Canonical kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidLocality(_)
            | Self::MalformedIdentifier(_)
            | Self::LocalityNotFound(_)
            | Self::UpgradeFailed(_)
            | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Api(api) => api.kind(),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TooManyResults { .. } => ErrorKind::TooManyResults,
            Self::TransientState { .. } => ErrorKind::TransientState,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ErrorState { .. } => ErrorKind::Unknown,
            Self::Transport(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    ErrorKind::Unavailable
                } else {
                    ErrorKind::Unknown
                }
            }
            Self::Decode(_) | Self::Other(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientState
    }

    /// Shorthand for a locally raised transient-state error
    pub fn transient(what: impl Into<String>, status: impl Into<String>) -> Self {
        Self::TransientState {
            what: what.into(),
            status: status.into(),
        }
    }
}

/// Per-kind rule deciding which errors mean "the remote object is gone"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotFoundPolicy {
    /// Some APIs (flexible IPs, load-balancer IPs) answer 403 for deleted objects
    pub forbidden_as_not_found: bool,
}

impl NotFoundPolicy {
    pub const STRICT: Self = Self {
        forbidden_as_not_found: false,
    };

    pub const FORBIDDEN_IS_GONE: Self = Self {
        forbidden_as_not_found: true,
    };

    pub fn is_gone(&self, err: &Error) -> bool {
        match err.kind() {
            ErrorKind::NotFound => true,
            ErrorKind::Forbidden => self.forbidden_as_not_found,
            _ => false,
        }
    }
}
