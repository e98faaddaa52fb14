//! Error types for lbmirror
//!
//! Errors carry enough context (which cluster connection, which stage of the
//! pipeline) to make a single log line actionable. Reconcilers never retry
//! internally: they return the error and the work queue re-delivers the key.

use thiserror::Error;

/// Main error type for lbmirror operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Cluster connection or command line configuration error
    #[error("configuration error [{cluster}]: {message}")]
    Config {
        /// The cluster reference being resolved (e.g. "INCLUSTER", a context name)
        cluster: String,
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "inner", "outer", "queue")
        context: String,
    },
}

impl Error {
    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error for a cluster reference
    pub fn config(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the API server answered 404 for this request
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source } if is_not_found(source))
    }

    /// Check if this error is retryable
    ///
    /// Conflicts (409) and throttling (429) are transient: the next pass reads
    /// a fresh object. Other 4xx answers need a change to the object or the
    /// configuration before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Whether a kube-rs error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
