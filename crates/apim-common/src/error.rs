//! Error types for the APIM operator
//!
//! Errors carry the resource or operation they relate to so that log lines and
//! status messages are useful without a debugger attached.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A declared value cannot be used (malformed identifier, bad URL, ...)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource carrying the invalid value
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.serviceUrl")
        field: Option<String>,
    },

    /// A record the pipeline depends on does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "APIMService")
        kind: String,
        /// Namespaced name that was looked up
        name: String,
    },

    /// A control-plane call failed
    #[error("control plane {operation} failed: {message}")]
    ControlPlane {
        /// Control-plane operation (e.g. "import_definition")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// No bearer token could be obtained
    #[error("credential error: {message}")]
    Credential {
        /// Description of what failed
        message: String,
    },

    /// The OpenAPI document could not be fetched
    #[error("fetch of {url} failed: {message}")]
    Fetch {
        /// Document URL
        url: String,
        /// Description of the last failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatcher", "executor")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a control-plane error for the named operation
    pub fn control_plane(operation: impl Into<String>, msg: impl ToString) -> Self {
        Self::ControlPlane {
            operation: operation.into(),
            message: msg.to_string(),
        }
    }

    /// Create a credential error
    pub fn credential(msg: impl ToString) -> Self {
        Self::Credential {
            message: msg.to_string(),
        }
    }

    /// Create a fetch error
    pub fn fetch(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Missing declarations and malformed input need a human to change
    /// something first. Everything that crosses a network boundary is
    /// treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::ControlPlane { .. } => true,
            Error::Credential { .. } => true,
            Error::Fetch { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short machine-friendly category, used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::ControlPlane { .. } => "control_plane",
            Error::Credential { .. } => "credential",
            Error::Fetch { .. } => "fetch",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
