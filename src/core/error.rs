use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// One unit-of-work file (or in-code unit) that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidUnit {
    pub name: String,
    pub origin: String,
    pub reason: String,
}

impl fmt::Display for InvalidUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.origin, self.reason)
    }
}

/// Coarse error classification, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    AlreadyRegistered,
    NotRegistered,
    AlreadyRunning,
    NotReady,
    Validation,
    Timeout,
    UnitOfWork,
    Adapter,
    Model,
    Plugin,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION",
            Self::AlreadyRegistered => "ALREADY_REGISTERED",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotReady => "NOT_READY",
            Self::Validation => "VALIDATION",
            Self::Timeout => "TIMEOUT",
            Self::UnitOfWork => "UNIT_OF_WORK",
            Self::Adapter => "ADAPTER",
            Self::Model => "MODEL",
            Self::Plugin => "PLUGIN",
            Self::Io => "IO",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0} '{1}' is already registered")]
    AlreadyRegistered(&'static str, String),

    #[error("{0} '{1}' is not registered")]
    NotRegistered(&'static str, String),

    #[error("Operation already running: {operation} on '{target}'")]
    AlreadyRunning { operation: String, target: String },

    #[error("Connection '{name}' is not ready (state: {state})")]
    NotReady { name: String, state: String },

    #[error("{} invalid {kind} unit(s): {}", .failures.len(), format_failures(.failures))]
    Validation {
        kind: String,
        failures: Vec<InvalidUnit>,
    },

    #[error("Operation {} timed out after {timeout_ms}ms", .operation.as_deref().unwrap_or("<anonymous>"))]
    Timeout {
        timeout_ms: u64,
        operation: Option<String>,
        details: BTreeMap<String, serde_json::Value>,
    },

    #[error("{kind} '{name}' failed: {source}")]
    UnitOfWork {
        kind: String,
        name: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Plugin '{name}' failed: {message}")]
    Plugin { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

fn format_failures(failures: &[InvalidUnit]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::AlreadyRegistered(..) => ErrorKind::AlreadyRegistered,
            Self::NotRegistered(..) => ErrorKind::NotRegistered,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnitOfWork { .. } => ErrorKind::UnitOfWork,
            Self::Adapter(_)
            | Self::TableExists(_)
            | Self::TableNotFound(_)
            | Self::ColumnNotFound(..)
            | Self::Parse(_)
            | Self::UnsupportedOperation(_) => ErrorKind::Adapter,
            Self::Model(_) => ErrorKind::Model,
            Self::Plugin { .. } => ErrorKind::Plugin,
            Self::Io(_) => ErrorKind::Io,
            Self::LockError(_) => ErrorKind::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Deadline carried by a timeout error.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Timeout { timeout_ms, .. } => Some(*timeout_ms),
            _ => None,
        }
    }

    /// Unit-of-work name for errors raised while running a migration or seed.
    pub fn unit_name(&self) -> Option<&str> {
        match self {
            Self::UnitOfWork { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl<T> From<std::sync::PoisonError<T>> for AppError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
