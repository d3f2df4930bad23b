//! The exception model.
//!
//! Exceptions are identified by their fully qualified type name
//! (`Outer::InnerError`). Every type is registered once in a
//! [`TypeHierarchy`], which computes the type's ancestor chain up front, so
//! rule evaluation only ever walks a plain list of names.
//!
//! # Examples
//!
//! ```
//! use faultline_core::exception::{ExceptionInfo, TypeHierarchy};
//!
//! let mut hierarchy = TypeHierarchy::with_defaults();
//! hierarchy.register("Billing::CardDeclined", Some("RuntimeError"))?;
//!
//! let exception = ExceptionInfo::new(hierarchy.lookup("Billing::CardDeclined"), "card declined");
//! assert_eq!(
//!     exception.ancestors(),
//!     ["RuntimeError", "StandardError", "Exception"]
//! );
//! # Ok::<(), faultline_core::Error>(())
//! ```

use std::any::type_name;
use std::error::Error as StdError;

use heck::ToSnakeCase;
use indexmap::IndexMap;

use crate::{Error, StatusCode};

/// The root of the default hierarchy.
pub const ROOT_TYPE: &str = "Exception";

/// The base type of the built-in HTTP status errors.
pub const HTTP_STATUS_ERROR: &str = "HttpStatusError";

const TYPE_SEPARATOR: &str = "::";

/// An exception type together with its precomputed ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionType {
    name: String,
    ancestors: Vec<String>,
}

impl ExceptionType {
    /// Creates a type that is not part of any hierarchy.
    ///
    /// Such a type has no ancestors, so only rules naming it directly (or its
    /// status code) can apply to it.
    #[must_use]
    pub fn unregistered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
        }
    }

    /// The fully qualified type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ancestor type names, nearest first, ending at the hierarchy root.
    #[must_use]
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// Returns `true` if this type is `name` or descends from it.
    #[must_use]
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|ancestor| ancestor == name)
    }

    /// The template file stem for this type, see [`file_stem`].
    #[must_use]
    pub fn file_stem(&self) -> String {
        file_stem(&self.name)
    }
}

/// Converts a type name into the stem used to look up template files.
///
/// Each `::`-separated segment is converted to snake case and the segments
/// are joined with `/`, so templates for namespaced exceptions live in
/// subdirectories.
///
/// ```
/// use faultline_core::exception::file_stem;
///
/// assert_eq!(file_stem("RuntimeError"), "runtime_error");
/// assert_eq!(file_stem("Billing::CardDeclined"), "billing/card_declined");
/// assert_eq!(file_stem("HTTPError"), "http_error");
/// ```
#[must_use]
pub fn file_stem(type_name: &str) -> String {
    type_name
        .split(TYPE_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_snake_case())
        .collect::<Vec<_>>()
        .join("/")
}

/// A registry of exception types and their parents.
///
/// Types must be registered parent first, which rules out cycles: every
/// ancestor chain ends at a root type.
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    types: IndexMap<String, ExceptionType>,
}

impl TypeHierarchy {
    /// Creates an empty hierarchy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hierarchy with the types named by the default configuration
    /// and the built-in HTTP status errors.
    ///
    /// ```text
    /// Exception
    /// ├── StandardError
    /// │   ├── RuntimeError, ArgumentError, TypeError, NameError
    /// │   └── TemplateError, RecordNotFound, ResourceNotFound, RoutingError,
    /// │       UnknownController, UnknownAction, MissingTemplate,
    /// │       MethodNotAllowed, InvalidAuthenticityToken
    /// └── HttpStatusError
    ///     └── HttpUnauthorized, HttpNotFound, HttpNotAcceptable,
    ///         HttpInternalServerError, HttpNotImplemented, HttpServiceUnavailable
    /// ```
    #[must_use]
    pub fn with_defaults() -> Self {
        const STANDARD_ERRORS: &[&str] = &[
            "RuntimeError",
            "ArgumentError",
            "TypeError",
            "NameError",
            "TemplateError",
            "RecordNotFound",
            "ResourceNotFound",
            "RoutingError",
            "UnknownController",
            "UnknownAction",
            "MissingTemplate",
            "MethodNotAllowed",
            "InvalidAuthenticityToken",
        ];

        let mut hierarchy = Self::new();
        hierarchy.insert_unchecked(ROOT_TYPE, None);
        hierarchy.insert_unchecked("StandardError", Some(ROOT_TYPE));
        for name in STANDARD_ERRORS {
            hierarchy.insert_unchecked(name, Some("StandardError"));
        }
        hierarchy.insert_unchecked(HTTP_STATUS_ERROR, Some(ROOT_TYPE));
        for (_, name) in HTTP_STATUS_TYPES {
            hierarchy.insert_unchecked(name, Some(HTTP_STATUS_ERROR));
        }
        hierarchy
    }

    /// Registers a type under `parent` (or as a root when `parent` is `None`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateType`] if `name` is already registered and
    /// [`Error::UnknownParentType`] if `parent` is not.
    pub fn register(&mut self, name: &str, parent: Option<&str>) -> crate::Result<&ExceptionType> {
        if self.types.contains_key(name) {
            return Err(Error::DuplicateType(name.to_string()));
        }
        if let Some(parent) = parent
            && !self.types.contains_key(parent)
        {
            return Err(Error::UnknownParentType {
                name: name.to_string(),
                parent: parent.to_string(),
            });
        }

        Ok(self.insert_unchecked(name, parent))
    }

    fn insert_unchecked(&mut self, name: &str, parent: Option<&str>) -> &ExceptionType {
        let ancestors = match parent.and_then(|parent| self.types.get(parent)) {
            Some(parent) => std::iter::once(parent.name.clone())
                .chain(parent.ancestors.iter().cloned())
                .collect(),
            None => Vec::new(),
        };

        let entry = ExceptionType {
            name: name.to_string(),
            ancestors,
        };
        let (index, _) = self.types.insert_full(name.to_string(), entry);
        &self.types[index]
    }

    /// Returns the registered type named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ExceptionType> {
        self.types.get(name)
    }

    /// Returns the registered type named `name`, or an
    /// [unregistered](ExceptionType::unregistered) type if it is unknown.
    #[must_use]
    pub fn lookup(&self, name: &str) -> ExceptionType {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| ExceptionType::unregistered(name))
    }

    /// Returns `true` if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Returns the number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if no types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

const HTTP_STATUS_TYPES: [(StatusCode, &str); 6] = [
    (StatusCode::UNAUTHORIZED, "HttpUnauthorized"),
    (StatusCode::NOT_FOUND, "HttpNotFound"),
    (StatusCode::NOT_ACCEPTABLE, "HttpNotAcceptable"),
    (StatusCode::INTERNAL_SERVER_ERROR, "HttpInternalServerError"),
    (StatusCode::NOT_IMPLEMENTED, "HttpNotImplemented"),
    (StatusCode::SERVICE_UNAVAILABLE, "HttpServiceUnavailable"),
];

/// A captured exception.
///
/// Built once when the exception is caught and never modified afterwards;
/// the `with_*` methods consume the value and are meant for construction
/// only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    exception_type: ExceptionType,
    message: String,
    backtrace: Vec<String>,
    status_code: Option<StatusCode>,
}

impl ExceptionInfo {
    /// Creates an exception of the given type with an empty backtrace.
    #[must_use]
    pub fn new(exception_type: ExceptionType, message: impl Into<String>) -> Self {
        Self {
            exception_type,
            message: message.into(),
            backtrace: Vec::new(),
            status_code: None,
        }
    }

    /// Captures a Rust error, using its concrete type name as the exception
    /// type and the current call stack as the backtrace.
    ///
    /// The type is looked up in `hierarchy`, so registering
    /// `std::any::type_name::<E>()` there gives the error an ancestry.
    #[must_use]
    pub fn from_error<E>(error: &E, hierarchy: &TypeHierarchy) -> Self
    where
        E: StdError + 'static,
    {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::new(hierarchy.lookup(type_name::<E>()), message).with_backtrace(capture_backtrace())
    }

    /// Creates one of the built-in HTTP status errors.
    ///
    /// The exception carries `status_code` itself, so the classifier returns
    /// it as is. Its message is the status line, followed by
    /// `additional_message` when one is given.
    ///
    /// ```
    /// use faultline_core::StatusCode;
    /// use faultline_core::exception::ExceptionInfo;
    ///
    /// let exception = ExceptionInfo::http_status(StatusCode::NOT_FOUND, Some("no such invoice"));
    /// assert_eq!(exception.type_name(), "HttpNotFound");
    /// assert_eq!(exception.message(), "404 Not Found: no such invoice");
    /// assert_eq!(exception.status_code(), Some(StatusCode::NOT_FOUND));
    /// ```
    #[must_use]
    pub fn http_status(status_code: StatusCode, additional_message: Option<&str>) -> Self {
        let exception_type = match HTTP_STATUS_TYPES
            .iter()
            .find(|(status, _)| *status == status_code)
        {
            Some((_, name)) => ExceptionType {
                name: (*name).to_string(),
                ancestors: vec![HTTP_STATUS_ERROR.to_string(), ROOT_TYPE.to_string()],
            },
            None => ExceptionType {
                name: HTTP_STATUS_ERROR.to_string(),
                ancestors: vec![ROOT_TYPE.to_string()],
            },
        };

        let mut message = format!("{} {}", status_code, status_code.reason_phrase());
        if let Some(additional_message) = additional_message {
            message.push_str(": ");
            message.push_str(additional_message);
        }

        Self::new(exception_type, message).with_status_code(status_code)
    }

    /// Sets the captured call-stack frames.
    #[must_use]
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Sets an explicit status code, bypassing the configured classification.
    #[must_use]
    pub fn with_status_code(mut self, status_code: StatusCode) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// The exception type.
    #[must_use]
    pub fn exception_type(&self) -> &ExceptionType {
        &self.exception_type
    }

    /// The fully qualified type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.exception_type.name()
    }

    /// The ancestor type names, nearest first.
    #[must_use]
    pub fn ancestors(&self) -> &[String] {
        self.exception_type.ancestors()
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured call-stack frames.
    #[must_use]
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }

    /// The explicit status code carried by the exception, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status_code
    }
}

/// Captures the current call stack as one line per resolved symbol.
#[must_use]
pub fn capture_backtrace() -> Vec<String> {
    let backtrace = backtrace::Backtrace::new();

    backtrace
        .frames()
        .iter()
        .flat_map(backtrace::BacktraceFrame::symbols)
        .map(|symbol| {
            let name = symbol
                .name()
                .map_or_else(|| "<unknown>".to_string(), |name| name.to_string());
            match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => format!("{name} at {}:{line}", file.display()),
                _ => name,
            }
        })
        .collect()
}
