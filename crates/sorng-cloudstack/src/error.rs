//! Error types for the CloudStack crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudStackErrorKind {
    /// A selector (project, zone, template, offering, network, VM, …) did not resolve
    NotFound,
    /// Mutually exclusive, missing or ambiguous inputs
    InvalidSpec,
    /// Requested transition is impossible from the observed state
    InvalidTransition,
    /// Provider reported an error, synchronously or in an async job result
    OperationFailed,
    /// The VM ended up in the provider's `Error` state
    ResourceInError,
    /// Endpoint unreachable
    ConnectionError,
    /// Signature or credentials rejected (401)
    AuthenticationError,
    /// HTTP error without a CloudStack error body
    ApiError(u16),
    /// JSON parse / unexpected response shape
    ParseError,
    /// Missing or invalid configuration
    ConfigError,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct CloudStackError {
    pub kind: CloudStackErrorKind,
    pub message: String,
}

impl CloudStackError {
    pub fn new(kind: CloudStackErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    /// `<kind> '<selector>' not found`
    pub fn not_found(kind: &str, selector: &str) -> Self {
        Self::new(
            CloudStackErrorKind::NotFound,
            format!("{kind} '{selector}' not found"),
        )
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::InvalidSpec, msg)
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::InvalidTransition, msg)
    }

    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::OperationFailed, msg)
    }

    pub fn in_error(vm_name: &str) -> Self {
        Self::new(
            CloudStackErrorKind::ResourceInError,
            format!("Virtual machine named '{vm_name}' in error state"),
        )
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::AuthenticationError, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::ParseError, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(CloudStackErrorKind::ConfigError, msg)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudStackErrorKind::NotFound
    }
}

impl fmt::Display for CloudStackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for CloudStackError {}

impl From<CloudStackError> for String {
    fn from(e: CloudStackError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for CloudStackError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::connection(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::api(
                e.status().map(|s| s.as_u16()).unwrap_or(0),
                format!("HTTP error: {e}"),
            )
        }
    }
}

impl From<serde_json::Error> for CloudStackError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

/// Convenience alias.
pub type CloudStackResult<T> = Result<T, CloudStackError>;
