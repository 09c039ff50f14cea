//! Error types for bundling, the remote protocol, and delivery.
//!
//! Each concern gets its own enum so callers can match on exactly the
//! failures they can act on:
//!
//! ```text
//! BundleError    analysis / extraction / archive (local, never retried)
//! RemoteError    one request against one remote target
//! DeliveryError  a full `deliver` invocation (wraps both, adds the
//!                persistent unknown-verifier case)
//! ```

use thiserror::Error;

/// Result type alias for bundling operations
pub type BundleResult<T> = Result<T, BundleError>;

/// Result type alias for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Failures while turning a verifier definition into a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The verifier source is not a parsable definition of the declared function.
    #[error("cannot parse verifier `{function}`: {reason}")]
    Parse { function: String, reason: String },

    /// A referenced name is neither local, external, stdlib nor a builtin.
    #[error("unresolved reference `{name}` in {scope}")]
    UnresolvedReference { name: String, scope: String },

    /// A local definition cannot be rendered as independently loadable source.
    #[error("cannot extract `{symbol}`: {reason}")]
    Extraction { symbol: String, reason: String },

    #[error("archive error: {0}")]
    Archive(String),

    /// Loading the local project from disk failed.
    #[error("project error: {0}")]
    Project(String),
}

impl BundleError {
    pub(crate) fn unresolved(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            name: name.into(),
            scope: scope.into(),
        }
    }

    pub(crate) fn extraction(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Extraction {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}

impl From<zip::result::ZipError> for BundleError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<std::io::Error> for BundleError {
    fn from(err: std::io::Error) -> Self {
        Self::Archive(err.to_string())
    }
}

/// Failures of a single request against a remote execution service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The target address is not a usable base URL.
    #[error("invalid target address `{0}`")]
    InvalidAddress(String),

    /// The request never produced a response (connect, timeout, reset).
    #[error("transmission failed: {0}")]
    Transmission(String),

    /// The service answered with a non-success HTTP status.
    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("malformed remote response: {0}")]
    Decode(String),

    /// The remote holds no loaded function for this verifier id.
    #[error("remote does not know verifier {verifier_id}: {message}")]
    UnknownVerifier {
        verifier_id: String,
        message: String,
    },

    /// The verifier ran remotely and failed; passed through unmodified.
    #[error("remote verifier raised {error_type}: {message}")]
    Execution {
        error_type: String,
        message: String,
        traceback: Option<String>,
    },
}

impl RemoteError {
    /// Whether the remote processed the request (the bundle, if any, was loaded).
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }

    pub fn is_unknown_verifier(&self) -> bool {
        matches!(self, Self::UnknownVerifier { .. })
    }
}

/// Failures of a `deliver` invocation.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The remote reported the verifier unknown again right after a full re-send.
    #[error("verifier {verifier_id} still unknown on {target} after re-sending its bundle")]
    PersistentUnknownVerifier { verifier_id: String, target: String },
}
