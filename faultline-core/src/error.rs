//! Errors raised while building configuration and registering exception
//! types.
//!
//! None of these can occur while an exception is being handled; they are all
//! reported at startup, when the configuration and the type hierarchy are
//! assembled.

use thiserror::Error;

const ERROR_PREFIX: &str = "faultline error:";

/// An error that can occur while setting up Faultline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be parsed.
    #[error("{ERROR_PREFIX} could not parse the configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    /// A regular expression in the configuration is invalid.
    #[error("{ERROR_PREFIX} invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// The pattern as written in the configuration.
        pattern: String,
        /// The underlying regex compilation error.
        source: regex::Error,
    },
    /// A status code is not a valid HTTP error status.
    #[error("{ERROR_PREFIX} invalid status code `{0}`")]
    InvalidStatusCode(String),
    /// An exception type was registered with a parent that is not known yet.
    #[error("{ERROR_PREFIX} unknown parent type `{parent}` for `{name}`")]
    UnknownParentType {
        /// The type being registered.
        name: String,
        /// The missing parent.
        parent: String,
    },
    /// An exception type was registered twice.
    #[error("{ERROR_PREFIX} type `{0}` is already registered")]
    DuplicateType(String),
}
