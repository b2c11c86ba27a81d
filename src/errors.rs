//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure. Never retried.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Phase rows were already created for the execution.
    AlreadyInitialized(String),
    /// Compare-and-set on a phase or execution status was rejected.
    InvalidTransition(String),
    /// Collaborator failure that may succeed on retry.
    Transient(String),
    /// Collaborator reported rate limiting; trips the circuit breaker.
    RateLimited(String),
    /// Collaborator failure that will not succeed on retry (not found, gone).
    Permanent(String),
    /// Call short-circuited because the dependency's breaker is open.
    CircuitOpen(String),
    /// Work was cancelled before it could finish.
    Cancelled(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the failure is worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyInitialized(msg) => write!(f, "already initialized: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::Permanent(msg) => write!(f, "permanent: {msg}"),
            Self::CircuitOpen(msg) => write!(f, "circuit open: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(err.to_string())
        } else if err.is_decode() {
            Self::Permanent(format!("undecodable response: {err}"))
        } else {
            Self::Transient(err.to_string())
        }
    }
}
