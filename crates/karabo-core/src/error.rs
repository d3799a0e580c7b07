//! Error types for the data model.
//!
//! `CoreError` covers every failure that can surface from Hash access, the
//! binary and XML codecs, schema construction and state parsing. All variants
//! are recoverable; callers decide whether to propagate or report them.
//!
//! ## Error Categories
//!
//! - **Access**: `PathNotFound`, `TypeMismatch`, `InvalidPath`
//! - **Conversion**: `Cast`
//! - **Codec**: `MalformedHash`, `Encode`, `Xml`
//! - **Domain**: `InvalidState`, `Schema`

use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Primary error type of the data model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A `get`-style access addressed a path that does not exist.
    #[error("Key '{path}' does not exist")]
    PathNotFound {
        /// The requested path
        path: String,
    },

    /// The stored value has a different type than the one requested.
    #[error("Type mismatch for '{path}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// The requested path
        path: String,
        /// Type name the caller asked for
        expected: String,
        /// Type name actually stored
        actual: String,
    },

    /// A value could not be converted into the target type.
    #[error("Failed to cast {value} from {from} to {to}")]
    Cast {
        /// Source type name
        from: String,
        /// Target type name
        to: String,
        /// Printable form of the offending value
        value: String,
    },

    /// A path expression could not be parsed or does not fit the tree shape.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// Offending path
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Binary decoding failed.
    ///
    /// Raised on truncated input, unknown type tags, and key lengths that
    /// point past the end of the buffer.
    #[error("Malformed hash at byte {offset}: {reason}")]
    MalformedHash {
        /// Byte offset into the input where decoding failed
        offset: usize,
        /// Description of the failure
        reason: String,
    },

    /// A hash cannot be represented in the binary format (e.g. key too long).
    #[error("Cannot encode hash: {0}")]
    Encode(String),

    /// XML serialization or parsing failed.
    #[error("XML codec error: {0}")]
    Xml(String),

    /// A string does not name a known state.
    #[error("'{0}' is not a valid state")]
    InvalidState(String),

    /// Schema construction or lookup failed.
    #[error("Schema error: {0}")]
    Schema(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::PathNotFound`].
    pub fn path_not_found(path: impl Into<String>) -> Self {
        CoreError::PathNotFound { path: path.into() }
    }

    /// Shorthand for [`CoreError::MalformedHash`].
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        CoreError::MalformedHash {
            offset,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoreError::InvalidPath`].
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<quick_xml::Error> for CoreError {
    fn from(err: quick_xml::Error) -> Self {
        CoreError::Xml(err.to_string())
    }
}
