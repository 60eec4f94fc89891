//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Error type returned by action implementations
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Graph construction errors
    #[error("No producer or provider for value {0}")]
    NoProducer(String),

    #[error("Multiple producers for value {value}: {}", producers.join(", "))]
    MultipleProducers {
        value: String,
        producers: Vec<String>,
    },

    #[error("Action with name {0} has already been registered")]
    DuplicateAction(String),

    #[error("Value {0} has already been provided")]
    AlreadyProvided(String),

    #[error("Value {value} is an output of registered action {action}")]
    ProvidedIsOutput { value: String, action: String },

    #[error("Output {value} of action {action} is already produced by {producer}")]
    OutputAlreadyProduced {
        action: String,
        value: String,
        producer: String,
    },

    #[error("Output {value} of action {action} has already been provided")]
    OutputIsProvided { action: String, value: String },

    #[error("Dependency cycle through action {0}")]
    DependencyCycle(String),

    #[error("No action registered with name {0}")]
    ActionNotFound(String),

    #[error("Action {0} is registered with a different type")]
    ActionTypeMismatch(String),

    #[error("Unsupported output {value} for action {action}, outputs must be created with output_file or output_dir")]
    UnsupportedOutput { action: String, value: String },

    // Value errors
    #[error("Path of {0} is not yet populated")]
    ValueUnbound(String),

    #[error("Value {value} is not a {expected}")]
    ValueKind {
        value: String,
        expected: &'static str,
    },

    // Lock errors
    #[error("Have been waiting on lock for '{}' for {waited_ms} ms. Giving up as timeout is {timeout_ms} ms.", path.display())]
    LockTimeout {
        path: PathBuf,
        waited_ms: u64,
        timeout_ms: u64,
    },

    // Execution errors
    #[error("Exception executing {name}")]
    ActionFailed {
        name: String,
        #[source]
        source: ActionError,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an action failure with the action's name
    pub fn action_failed(name: impl Into<String>, source: ActionError) -> Self {
        Self::ActionFailed {
            name: name.into(),
            source,
        }
    }

    /// Whether this error was raised while building the graph, before anything ran
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::NoProducer(_)
                | Self::MultipleProducers { .. }
                | Self::DuplicateAction(_)
                | Self::AlreadyProvided(_)
                | Self::ProvidedIsOutput { .. }
                | Self::OutputAlreadyProduced { .. }
                | Self::OutputIsProvided { .. }
                | Self::DependencyCycle(_)
                | Self::UnsupportedOutput { .. }
        )
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::ActionFailed { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => Some(
                "If no other build is running, kill any stale process and delete the lock file manually",
            ),
            Self::NoProducer(_) => Some("Mark the value as provided or register an action producing it"),
            Self::InvalidDuration { .. } => Some("Use a number followed by d, h, m or s, e.g. 12h"),
            _ => None,
        }
    }
}
