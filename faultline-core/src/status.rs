//! HTTP error status codes.
//!
//! Exceptions are always classified into a 4xx or 5xx status. The value is
//! written everywhere in its three-digit string form (`"404"`): in
//! configuration files, in template file names, and in notifications.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// An HTTP error status code (`400`-`599`).
///
/// This is a thin wrapper around [`http::StatusCode`] that only admits error
/// statuses and (de)serializes as a three-digit string.
///
/// # Examples
///
/// ```
/// use faultline_core::StatusCode;
///
/// let status: StatusCode = "503".parse().unwrap();
/// assert_eq!(status.as_str(), "503");
/// assert_eq!(status.reason_phrase(), "Service Unavailable");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(http::StatusCode);

impl StatusCode {
    /// `400 Bad Request`
    pub const BAD_REQUEST: Self = Self(http::StatusCode::BAD_REQUEST);
    /// `401 Unauthorized`
    pub const UNAUTHORIZED: Self = Self(http::StatusCode::UNAUTHORIZED);
    /// `403 Forbidden`
    pub const FORBIDDEN: Self = Self(http::StatusCode::FORBIDDEN);
    /// `404 Not Found`
    pub const NOT_FOUND: Self = Self(http::StatusCode::NOT_FOUND);
    /// `405 Method Not Allowed`
    pub const METHOD_NOT_ALLOWED: Self = Self(http::StatusCode::METHOD_NOT_ALLOWED);
    /// `406 Not Acceptable`
    pub const NOT_ACCEPTABLE: Self = Self(http::StatusCode::NOT_ACCEPTABLE);
    /// `422 Unprocessable Entity`
    pub const UNPROCESSABLE_ENTITY: Self = Self(http::StatusCode::UNPROCESSABLE_ENTITY);
    /// `500 Internal Server Error`
    pub const INTERNAL_SERVER_ERROR: Self = Self(http::StatusCode::INTERNAL_SERVER_ERROR);
    /// `501 Not Implemented`
    pub const NOT_IMPLEMENTED: Self = Self(http::StatusCode::NOT_IMPLEMENTED);
    /// `502 Bad Gateway`
    pub const BAD_GATEWAY: Self = Self(http::StatusCode::BAD_GATEWAY);
    /// `503 Service Unavailable`
    pub const SERVICE_UNAVAILABLE: Self = Self(http::StatusCode::SERVICE_UNAVAILABLE);

    /// Creates a status code from its numeric value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusCode`] if `code` is not in the
    /// `400..=599` range.
    pub fn from_u16(code: u16) -> crate::Result<Self> {
        if !(400..=599).contains(&code) {
            return Err(Error::InvalidStatusCode(code.to_string()));
        }
        http::StatusCode::from_u16(code)
            .map(Self)
            .map_err(|_| Error::InvalidStatusCode(code.to_string()))
    }

    /// Returns the numeric value of the status code.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0.as_u16()
    }

    /// Returns the three-digit string form, e.g. `"404"`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the human-readable reason phrase, e.g. `"Not Found"`.
    ///
    /// Codes without a registered phrase return `"Unknown Status"`.
    #[must_use]
    pub fn reason_phrase(self) -> &'static str {
        self.0.canonical_reason().unwrap_or("Unknown Status")
    }

    /// Returns `true` for `5xx` codes.
    #[must_use]
    pub fn is_server_error(self) -> bool {
        self.0.is_server_error()
    }

    /// Returns the wrapped [`http::StatusCode`].
    #[must_use]
    pub fn to_http(self) -> http::StatusCode {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatusCode(s.to_string()))?;
        Self::from_u16(code)
    }
}

impl TryFrom<http::StatusCode> for StatusCode {
    type Error = Error;

    fn try_from(value: http::StatusCode) -> Result<Self, Self::Error> {
        Self::from_u16(value.as_u16())
    }
}

impl From<StatusCode> for http::StatusCode {
    fn from(value: StatusCode) -> Self {
        value.0
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatusCodeVisitor;

        impl Visitor<'_> for StatusCodeVisitor {
            type Value = StatusCode;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an HTTP error status code such as \"404\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                let code = u16::try_from(v).map_err(E::custom)?;
                StatusCode::from_u16(code).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                let code = u16::try_from(v).map_err(E::custom)?;
                StatusCode::from_u16(code).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(StatusCodeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let status: StatusCode = "404".parse().unwrap();

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(status.to_string(), "404");
    }

    #[test]
    fn rejects_non_error_codes() {
        assert!("200".parse::<StatusCode>().is_err());
        assert!("302".parse::<StatusCode>().is_err());
        assert!("600".parse::<StatusCode>().is_err());
        assert!("abc".parse::<StatusCode>().is_err());
    }

    #[test]
    fn reason_phrase() {
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED.reason_phrase(), "Method Not Allowed");
        assert_eq!(
            StatusCode::from_u16(599).unwrap().reason_phrase(),
            "Unknown Status"
        );
    }

    #[test]
    fn http_conversions() {
        let status = StatusCode::try_from(http::StatusCode::BAD_GATEWAY).unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(http::StatusCode::from(status), http::StatusCode::BAD_GATEWAY);
        assert!(StatusCode::try_from(http::StatusCode::OK).is_err());
    }
}
