//! # Error Handling
//!
//! Error types for the filter chain orchestrator, defined with `thiserror`.
//!
//! Most errors never reach the host: a missing plugin is logged and dropped,
//! a bad plugin config is swapped for a sentinel filter, and panics become
//! 500 local replies. The variants still exist as values so those paths can
//! log and test them uniformly.

/// Custom result type for filter chain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the filter chain orchestrator
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A config references a plugin name nobody registered
    #[error("Plugin not found: {name}")]
    PluginNotFound { name: String },

    /// A plugin rejected its configuration
    #[error("Failed to parse config for plugin {plugin}: {message}")]
    ConfigParse { plugin: String, message: String },

    /// A plugin declaration is inconsistent
    #[error("Invalid plugin {plugin}: {message}")]
    Registration { plugin: String, message: String },

    /// Deferred one-time initialization failed
    #[error("Failed to init plugin {plugin}: {message}")]
    Init { plugin: String, message: String },

    /// A panic recovered at a dispatch boundary
    #[error("Panic during {context}: {message}")]
    Panic { context: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn plugin_not_found<S: Into<String>>(name: S) -> Self {
        Self::PluginNotFound { name: name.into() }
    }

    pub fn config_parse<P: Into<String>, M: Into<String>>(plugin: P, message: M) -> Self {
        Self::ConfigParse { plugin: plugin.into(), message: message.into() }
    }

    pub fn registration<P: Into<String>, M: Into<String>>(plugin: P, message: M) -> Self {
        Self::Registration { plugin: plugin.into(), message: message.into() }
    }

    pub fn init<P: Into<String>, M: Into<String>>(plugin: P, message: M) -> Self {
        Self::Init { plugin: plugin.into(), message: message.into() }
    }

    /// Build a panic error from a `catch_unwind` payload.
    pub fn from_panic<S: Into<String>>(
        context: S,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        Self::Panic { context: context.into(), message: panic_message(payload) }
    }

    /// HTTP status the host should see when this error ends a stream.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::PluginNotFound { .. } => 404,
            Error::Validation(_) => 400,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source, context: "JSON processing failed".to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
