//! Configuration for exception handling.
//!
//! A [`FaultlineConfig`] is assembled once at startup, either with
//! [`FaultlineConfig::builder`] or from a TOML document with
//! [`FaultlineConfig::from_toml`], and handed to the exception handler, which
//! keeps it behind an [`Arc`](std::sync::Arc). There is no way to change the
//! configuration afterwards; a different configuration means a different
//! handler.
//!
//! # Examples
//!
//! ```
//! use faultline_core::StatusCode;
//! use faultline_core::config::FaultlineConfig;
//!
//! let config = FaultlineConfig::builder()
//!     .app_name("billing")
//!     .notify_on_local_error(true)
//!     .map_status_code("Billing::CardDeclined", StatusCode::UNPROCESSABLE_ENTITY)
//!     .build();
//!
//! assert_eq!(config.app_name, "billing");
//! assert_eq!(
//!     config.error_class_status_codes.get("Billing::CardDeclined"),
//!     Some(StatusCode::UNPROCESSABLE_ENTITY)
//! );
//! // the defaults are still there
//! assert_eq!(
//!     config.error_class_status_codes.get("NameError"),
//!     Some(StatusCode::SERVICE_UNAVAILABLE)
//! );
//! ```
//!
//! The same configuration in TOML:
//!
//! ```
//! use faultline_core::config::FaultlineConfig;
//!
//! let config = FaultlineConfig::from_toml(
//!     r#"
//!     app_name = "billing"
//!     notify_on_local_error = true
//!     notify_status_codes = ["500", "503"]
//!     block_notify_on_request_headers = [
//!         { header = "HTTP_USER_AGENT", pattern = "(?i)bot" },
//!     ]
//!
//!     [notifier]
//!     from_address = "errors@example.com"
//!     recipient_addresses = ["oncall@example.com"]
//!     "#,
//! )?;
//!
//! assert!(config.notifier.is_deliverable());
//! # Ok::<(), faultline_core::Error>(())
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_builder::Builder;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, StatusCode};

const LAST_RESORT_TEMPLATE_NAME: &str = "500.html";

/// A compiled regular expression used in configuration.
///
/// Serialized as its source string.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if `pattern` is not a valid regular
    /// expression.
    pub fn new(pattern: &str) -> crate::Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Returns `true` if the pattern matches anywhere in `haystack`.
    #[must_use]
    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }

    /// The source of the pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// Selects request environment keys to leave out of the request data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvKeyMatcher {
    /// Matches a key exactly.
    Exact(String),
    /// Matches keys starting with the prefix.
    Prefix(String),
    /// Matches keys the pattern matches.
    Pattern(Pattern),
}

impl EnvKeyMatcher {
    /// Creates a matcher for exactly `key`.
    #[must_use]
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// Creates a matcher for keys starting with `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Creates a matcher from a regular expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if `pattern` does not compile.
    pub fn pattern(pattern: &str) -> crate::Result<Self> {
        Pattern::new(pattern).map(Self::Pattern)
    }

    /// Returns `true` if `key` is selected by this matcher.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Pattern(pattern) => pattern.is_match(key),
        }
    }
}

/// Suppresses notifications for requests where `header` matches `pattern`.
///
/// The header is looked up in the request environment, the query parameters
/// and the body parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBlockRule {
    /// The environment key or parameter name, e.g. `HTTP_USER_AGENT`.
    pub header: String,
    /// The pattern that blocks notification when it matches.
    pub pattern: Pattern,
}

impl HeaderBlockRule {
    /// Creates a rule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if `pattern` does not compile.
    pub fn new(header: impl Into<String>, pattern: &str) -> crate::Result<Self> {
        Ok(Self {
            header: header.into(),
            pattern: Pattern::new(pattern)?,
        })
    }

    /// Returns `true` if `value` should block notification.
    #[must_use]
    pub fn blocks(&self, value: &str) -> bool {
        self.pattern.is_match(value)
    }
}

/// Mapping from exception type names to status codes, with a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusCodeTable {
    /// The code for types without an entry in `codes`.
    pub default: StatusCode,
    /// Explicit mappings, keyed by fully qualified type name.
    pub codes: IndexMap<String, StatusCode>,
}

impl StatusCodeTable {
    /// Creates an empty table that maps everything to `default`.
    #[must_use]
    pub fn new(default: StatusCode) -> Self {
        Self {
            default,
            codes: IndexMap::new(),
        }
    }

    /// Returns the explicit mapping for `type_name`, if any.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<StatusCode> {
        self.codes.get(type_name).copied()
    }

    /// Adds or replaces the mapping for `type_name`.
    pub fn insert(&mut self, type_name: impl Into<String>, status_code: StatusCode) {
        self.codes.insert(type_name.into(), status_code);
    }
}

impl Default for StatusCodeTable {
    fn default() -> Self {
        let codes = [
            ("NameError", StatusCode::SERVICE_UNAVAILABLE),
            ("TypeError", StatusCode::SERVICE_UNAVAILABLE),
            ("RuntimeError", StatusCode::INTERNAL_SERVER_ERROR),
            ("ArgumentError", StatusCode::INTERNAL_SERVER_ERROR),
            ("TemplateError", StatusCode::INTERNAL_SERVER_ERROR),
            ("RecordNotFound", StatusCode::BAD_REQUEST),
            ("ResourceNotFound", StatusCode::NOT_FOUND),
            ("UnknownController", StatusCode::NOT_FOUND),
            ("MissingTemplate", StatusCode::NOT_FOUND),
            ("RoutingError", StatusCode::NOT_FOUND),
            ("MethodNotAllowed", StatusCode::METHOD_NOT_ALLOWED),
            ("InvalidAuthenticityToken", StatusCode::METHOD_NOT_ALLOWED),
            ("UnknownAction", StatusCode::NOT_IMPLEMENTED),
        ]
        .into_iter()
        .map(|(name, code)| (name.to_string(), code))
        .collect();

        Self {
            default: StatusCode::INTERNAL_SERVER_ERROR,
            codes,
        }
    }
}

/// Envelope settings for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip, error = std::convert::Infallible))]
#[serde(default)]
pub struct NotifierConfig {
    /// The sender address. Notifications are not sent when it is empty.
    #[builder(setter(into))]
    pub from_address: String,
    /// The recipients. Notifications are not sent when there are none.
    #[builder(setter(into))]
    pub recipient_addresses: Vec<String>,
    /// Text placed at the start of the subject line, after the process name.
    #[builder(setter(into))]
    pub subject_prefix: String,
}

impl NotifierConfig {
    /// Creates a new [`NotifierConfigBuilder`].
    #[must_use]
    pub fn builder() -> NotifierConfigBuilder {
        NotifierConfigBuilder::default()
    }

    /// Returns `true` if both a sender and at least one recipient are set.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        !self.from_address.trim().is_empty()
            && self
                .recipient_addresses
                .iter()
                .any(|address| !address.trim().is_empty())
    }
}

impl NotifierConfigBuilder {
    /// Builds the notifier configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(&self) -> NotifierConfig {
        let defaults = NotifierConfig::default();
        NotifierConfig {
            from_address: self.from_address.clone().unwrap_or(defaults.from_address),
            recipient_addresses: self
                .recipient_addresses
                .clone()
                .unwrap_or(defaults.recipient_addresses),
            subject_prefix: self
                .subject_prefix
                .clone()
                .unwrap_or(defaults.subject_prefix),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            from_address: String::new(),
            recipient_addresses: Vec::new(),
            subject_prefix: "ERROR".to_string(),
        }
    }
}

/// The exception handling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip, error = std::convert::Infallible))]
#[serde(default)]
pub struct FaultlineConfig {
    /// The default process name used in logs and notification subjects.
    #[builder(setter(into))]
    pub app_name: String,
    /// Whether exceptions from local requests are handled at all.
    pub handle_local_errors: bool,
    /// Whether exceptions from public requests are handled at all.
    pub handle_public_errors: bool,
    /// Notify for local requests.
    pub notify_on_local_error: bool,
    /// Notify for public requests.
    pub notify_on_public_error: bool,
    /// Notify for exceptions raised outside of any request.
    pub notify_on_background_error: bool,
    /// Rules suppressing notification for matching requests. Any single
    /// match blocks.
    pub block_notify_on_request_headers: Vec<HeaderBlockRule>,
    /// Queue notifications raised in a controller context, when a queue is
    /// available.
    pub async_for_controller_errors: bool,
    /// Queue notifications raised outside a controller context, when a queue
    /// is available.
    pub async_for_non_controller_errors: bool,
    /// Exception type to status code mapping.
    pub error_class_status_codes: StatusCodeTable,
    /// Exception types that always notify (subject to the context gate).
    pub notify_exception_classes: Vec<String>,
    /// Status codes that notify (subject to the context gate).
    pub notify_status_codes: Vec<StatusCode>,
    /// Application error templates, searched first.
    #[builder(setter(into, strip_option))]
    pub error_template_dir: Option<PathBuf>,
    /// Public assets directory, searched second.
    #[builder(setter(into, strip_option))]
    pub public_dir: Option<PathBuf>,
    /// Templates shipped with the library, searched last.
    #[builder(setter(into, strip_option))]
    pub bundled_template_dir: Option<PathBuf>,
    /// Explicit exception type to HTML template mappings.
    pub error_class_html_templates: IndexMap<String, PathBuf>,
    /// Explicit exception type to JavaScript template mappings.
    pub error_class_js_templates: IndexMap<String, PathBuf>,
    /// Application-wide fallback template when nothing else matches.
    #[builder(setter(into, strip_option))]
    pub default_error_template: Option<PathBuf>,
    /// The template of last resort. Defaults to `500.html` in the bundled
    /// template directory.
    #[builder(setter(into, strip_option))]
    pub absolute_last_resort_template: Option<PathBuf>,
    /// Request environment keys left out of notification request data.
    pub request_env_to_skip: Vec<EnvKeyMatcher>,
    /// Notification envelope settings.
    pub notifier: NotifierConfig,
}

impl FaultlineConfig {
    /// Creates a new [`FaultlineConfigBuilder`].
    #[must_use]
    pub fn builder() -> FaultlineConfigBuilder {
        FaultlineConfigBuilder::default()
    }

    /// Parses a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigParse`] if the document is not valid TOML, or
    /// contains invalid patterns or status codes.
    pub fn from_toml(toml_content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_content)?)
    }

    /// The directories searched for error templates, in priority order.
    pub fn template_search_dirs(&self) -> impl Iterator<Item = &Path> {
        [
            self.error_template_dir.as_deref(),
            self.public_dir.as_deref(),
            self.bundled_template_dir.as_deref(),
        ]
        .into_iter()
        .flatten()
    }

    /// The template of last resort, if one can be determined.
    #[must_use]
    pub fn last_resort_template(&self) -> Option<PathBuf> {
        self.absolute_last_resort_template.clone().or_else(|| {
            self.bundled_template_dir
                .as_ref()
                .map(|dir| dir.join(LAST_RESORT_TEMPLATE_NAME))
        })
    }

    /// Returns `true` if `key` should be left out of the request data.
    #[must_use]
    pub fn skips_request_env(&self, key: &str) -> bool {
        self.request_env_to_skip
            .iter()
            .any(|matcher| matcher.matches(key))
    }
}

impl Default for FaultlineConfig {
    fn default() -> Self {
        let request_env_to_skip = vec![
            EnvKeyMatcher::prefix("rack."),
            EnvKeyMatcher::exact("action_controller.rescue.request"),
            EnvKeyMatcher::exact("action_controller.rescue.response"),
        ];

        Self {
            app_name: String::new(),
            handle_local_errors: false,
            handle_public_errors: true,
            notify_on_local_error: false,
            notify_on_public_error: true,
            notify_on_background_error: true,
            block_notify_on_request_headers: Vec::new(),
            async_for_controller_errors: true,
            async_for_non_controller_errors: true,
            error_class_status_codes: StatusCodeTable::default(),
            notify_exception_classes: Vec::new(),
            notify_status_codes: vec![
                StatusCode::METHOD_NOT_ALLOWED,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::SERVICE_UNAVAILABLE,
            ],
            error_template_dir: None,
            public_dir: None,
            bundled_template_dir: None,
            error_class_html_templates: IndexMap::new(),
            error_class_js_templates: IndexMap::new(),
            default_error_template: None,
            absolute_last_resort_template: None,
            request_env_to_skip,
            notifier: NotifierConfig::default(),
        }
    }
}

impl FaultlineConfigBuilder {
    /// Adds a status code mapping on top of the current (or default) table.
    pub fn map_status_code(
        &mut self,
        type_name: impl Into<String>,
        status_code: StatusCode,
    ) -> &mut Self {
        self.error_class_status_codes
            .get_or_insert_with(StatusCodeTable::default)
            .insert(type_name, status_code);
        self
    }

    /// Sets the status code used for types without a mapping.
    pub fn default_status_code(&mut self, status_code: StatusCode) -> &mut Self {
        self.error_class_status_codes
            .get_or_insert_with(StatusCodeTable::default)
            .default = status_code;
        self
    }

    /// Maps an exception type to an HTML error template.
    pub fn map_html_template(
        &mut self,
        type_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> &mut Self {
        self.error_class_html_templates
            .get_or_insert_with(IndexMap::new)
            .insert(type_name.into(), path.into());
        self
    }

    /// Maps an exception type to a JavaScript error template.
    pub fn map_js_template(
        &mut self,
        type_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> &mut Self {
        self.error_class_js_templates
            .get_or_insert_with(IndexMap::new)
            .insert(type_name.into(), path.into());
        self
    }

    /// Adds a header blocking rule.
    pub fn block_notify_on_header(&mut self, rule: HeaderBlockRule) -> &mut Self {
        self.block_notify_on_request_headers
            .get_or_insert_with(Vec::new)
            .push(rule);
        self
    }

    /// Adds a request environment key matcher on top of the current (or
    /// default) list.
    pub fn skip_request_env(&mut self, matcher: EnvKeyMatcher) -> &mut Self {
        self.request_env_to_skip
            .get_or_insert_with(|| FaultlineConfig::default().request_env_to_skip)
            .push(matcher);
        self
    }

    /// Builds the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(&self) -> FaultlineConfig {
        let defaults = FaultlineConfig::default();
        FaultlineConfig {
            app_name: self.app_name.clone().unwrap_or(defaults.app_name),
            handle_local_errors: self
                .handle_local_errors
                .unwrap_or(defaults.handle_local_errors),
            handle_public_errors: self
                .handle_public_errors
                .unwrap_or(defaults.handle_public_errors),
            notify_on_local_error: self
                .notify_on_local_error
                .unwrap_or(defaults.notify_on_local_error),
            notify_on_public_error: self
                .notify_on_public_error
                .unwrap_or(defaults.notify_on_public_error),
            notify_on_background_error: self
                .notify_on_background_error
                .unwrap_or(defaults.notify_on_background_error),
            block_notify_on_request_headers: self
                .block_notify_on_request_headers
                .clone()
                .unwrap_or(defaults.block_notify_on_request_headers),
            async_for_controller_errors: self
                .async_for_controller_errors
                .unwrap_or(defaults.async_for_controller_errors),
            async_for_non_controller_errors: self
                .async_for_non_controller_errors
                .unwrap_or(defaults.async_for_non_controller_errors),
            error_class_status_codes: self
                .error_class_status_codes
                .clone()
                .unwrap_or(defaults.error_class_status_codes),
            notify_exception_classes: self
                .notify_exception_classes
                .clone()
                .unwrap_or(defaults.notify_exception_classes),
            notify_status_codes: self
                .notify_status_codes
                .clone()
                .unwrap_or(defaults.notify_status_codes),
            error_template_dir: self
                .error_template_dir
                .clone()
                .unwrap_or(defaults.error_template_dir),
            public_dir: self.public_dir.clone().unwrap_or(defaults.public_dir),
            bundled_template_dir: self
                .bundled_template_dir
                .clone()
                .unwrap_or(defaults.bundled_template_dir),
            error_class_html_templates: self
                .error_class_html_templates
                .clone()
                .unwrap_or(defaults.error_class_html_templates),
            error_class_js_templates: self
                .error_class_js_templates
                .clone()
                .unwrap_or(defaults.error_class_js_templates),
            default_error_template: self
                .default_error_template
                .clone()
                .unwrap_or(defaults.default_error_template),
            absolute_last_resort_template: self
                .absolute_last_resort_template
                .clone()
                .unwrap_or(defaults.absolute_last_resort_template),
            request_env_to_skip: self
                .request_env_to_skip
                .clone()
                .unwrap_or(defaults.request_env_to_skip),
            notifier: self.notifier.clone().unwrap_or(defaults.notifier),
        }
    }
}
