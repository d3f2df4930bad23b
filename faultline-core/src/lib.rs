//! Core data model for Faultline.
//!
//! This crate contains the types shared by every part of the exception
//! handling engine: status codes, the exception model with its precomputed
//! type ancestry, the immutable configuration, the exception classifier and
//! the request model used to build sanitized request data.
//!
//! Most applications should depend on the `faultline` crate, which re-exports
//! everything from here and adds the notification policy, the template
//! resolver and the handler orchestrating them.

pub mod classifier;
pub mod config;
pub mod error;
pub mod exception;
pub mod request;
pub mod status;

pub use crate::error::Error;

/// A type alias for a result that can return a [`faultline_core::Error`].
///
/// [`faultline_core::Error`]: crate::Error
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::status::StatusCode;
