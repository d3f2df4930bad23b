//! The request an exception was raised in.
//!
//! [`RequestContext`] is what the application hands to the handler: CGI-style
//! environment keys, the decoded parameters, and whether the request came
//! from a local or a public client. [`RequestData`] is the sanitized copy of
//! it that ends up in notifications.

use derive_more::Display;
use heck::ToShoutySnakeCase;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::FaultlineConfig;

/// The mask [`FilterKeys`] writes in place of filtered values.
pub const FILTERED_MASK: &str = "[FILTERED]";

/// Where a request came from.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    /// A client the application considers local, such as a developer
    /// machine.
    #[display("local")]
    Local,
    /// Any other client.
    #[display("public")]
    Public,
}

impl Locality {
    /// Returns `true` for [`Locality::Local`].
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

/// The request an exception was raised in.
///
/// # Examples
///
/// ```
/// use faultline_core::request::{Locality, RequestContext};
///
/// let request = RequestContext::new(Locality::Public)
///     .with_env("HTTP_HOST", "shop.example.com")
///     .with_query_param("page", "2");
///
/// assert_eq!(request.env_value("HTTP_HOST"), Some("shop.example.com"));
/// assert_eq!(request.values("page").collect::<Vec<_>>(), ["2"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    env: IndexMap<String, String>,
    query_params: IndexMap<String, String>,
    body_params: IndexMap<String, String>,
    locality: Locality,
}

impl RequestContext {
    /// Creates an empty request context.
    #[must_use]
    pub fn new(locality: Locality) -> Self {
        Self {
            env: IndexMap::new(),
            query_params: IndexMap::new(),
            body_params: IndexMap::new(),
            locality,
        }
    }

    /// Builds a context from an [`http::Request`].
    ///
    /// Headers become `HTTP_*` keys (`Content-Type` and `Content-Length`
    /// become `CONTENT_TYPE` and `CONTENT_LENGTH`), repeated headers are
    /// joined with `", "`. `REQUEST_METHOD`, `REQUEST_URI`, `QUERY_STRING` and
    /// `SERVER_PROTOCOL` are set from the request line, and `HTTP_HOST` falls
    /// back to the URI authority. The query string is decoded into the query
    /// parameters. The body is not read.
    ///
    /// ```
    /// use faultline_core::request::{Locality, RequestContext};
    ///
    /// let request = http::Request::get("https://shop.example.com/cart?item=42")
    ///     .header("X-Real-IP", "10.0.0.7")
    ///     .body(())
    ///     .unwrap();
    ///
    /// let context = RequestContext::from_http(&request, Locality::Public);
    /// assert_eq!(context.env_value("HTTP_X_REAL_IP"), Some("10.0.0.7"));
    /// assert_eq!(context.env_value("HTTP_HOST"), Some("shop.example.com"));
    /// assert_eq!(context.env_value("REQUEST_URI"), Some("/cart?item=42"));
    /// assert_eq!(context.query_params()["item"], "42");
    /// ```
    #[must_use]
    pub fn from_http<B>(request: &http::Request<B>, locality: Locality) -> Self {
        let mut context = Self::new(locality);

        for name in request.headers().keys() {
            let value = request
                .headers()
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            context.env.insert(env_key_for_header(name.as_str()), value);
        }

        let uri = request.uri();
        if !context.env.contains_key("HTTP_HOST")
            && let Some(authority) = uri.authority()
        {
            context
                .env
                .insert("HTTP_HOST".to_string(), authority.to_string());
        }
        context.env.insert(
            "REQUEST_METHOD".to_string(),
            request.method().as_str().to_string(),
        );
        context.env.insert(
            "REQUEST_URI".to_string(),
            uri.path_and_query()
                .map_or_else(|| uri.path().to_string(), ToString::to_string),
        );
        context.env.insert(
            "QUERY_STRING".to_string(),
            uri.query().unwrap_or_default().to_string(),
        );
        context.env.insert(
            "SERVER_PROTOCOL".to_string(),
            format!("{:?}", request.version()),
        );

        if let Some(query) = uri.query() {
            context.query_params.extend(
                form_urlencoded::parse(query.as_bytes())
                    .map(|(key, value)| (key.into_owned(), value.into_owned())),
            );
        }

        context
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Adds a body parameter.
    #[must_use]
    pub fn with_body_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.body_params.insert(key.into(), value.into());
        self
    }

    /// Decodes an `application/x-www-form-urlencoded` body into the body
    /// parameters.
    #[must_use]
    pub fn with_form_body(mut self, body: &[u8]) -> Self {
        self.body_params.extend(
            form_urlencoded::parse(body).map(|(key, value)| (key.into_owned(), value.into_owned())),
        );
        self
    }

    /// The environment entries.
    #[must_use]
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Returns the environment value for `key`.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The query parameters.
    #[must_use]
    pub fn query_params(&self) -> &IndexMap<String, String> {
        &self.query_params
    }

    /// The body parameters.
    #[must_use]
    pub fn body_params(&self) -> &IndexMap<String, String> {
        &self.body_params
    }

    /// Where the request came from.
    #[must_use]
    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Returns the values stored under `key` in the environment, the query
    /// parameters and the body parameters, in that order.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        [&self.env, &self.query_params, &self.body_params]
            .into_iter()
            .filter_map(move |map| map.get(key).map(String::as_str))
    }
}

fn env_key_for_header(name: &str) -> String {
    let key = name.to_shouty_snake_case();
    match key.as_str() {
        "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
        _ => format!("HTTP_{key}"),
    }
}

/// Masks sensitive parameter values before they leave the process.
pub trait ParameterFilter: Send + Sync {
    /// Returns the value to record for `key`.
    fn filter(&self, key: &str, value: &str) -> String;
}

/// Masks parameters whose name contains one of the configured keys,
/// ignoring case.
///
/// ```
/// use faultline_core::request::{FilterKeys, ParameterFilter};
///
/// let filter = FilterKeys::new(["password", "token"]);
/// assert_eq!(filter.filter("user[password]", "hunter2"), "[FILTERED]");
/// assert_eq!(filter.filter("AUTH_TOKEN", "abc"), "[FILTERED]");
/// assert_eq!(filter.filter("page", "2"), "2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterKeys {
    keys: Vec<String>,
    mask: String,
}

impl FilterKeys {
    /// Creates a filter for `keys` using [`FILTERED_MASK`].
    #[must_use]
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|key| key.as_ref().to_lowercase())
                .collect(),
            mask: FILTERED_MASK.to_string(),
        }
    }

    /// Replaces the mask.
    #[must_use]
    pub fn with_mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = mask.into();
        self
    }
}

impl ParameterFilter for FilterKeys {
    fn filter(&self, key: &str, value: &str) -> String {
        let key = key.to_lowercase();
        if self.keys.iter().any(|filtered| key.contains(filtered.as_str())) {
            self.mask.clone()
        } else {
            value.to_string()
        }
    }
}

/// The sanitized request, as recorded in notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// Environment entries, minus the configured skip keys.
    pub env: IndexMap<String, String>,
    /// Query parameters merged with body parameters; body values win.
    pub params: IndexMap<String, String>,
}

impl RequestData {
    /// Sanitizes `request` according to `config`.
    ///
    /// Environment keys selected by
    /// [`request_env_to_skip`](FaultlineConfig::request_env_to_skip) are
    /// dropped. Environment and parameter values are passed through `filter`
    /// when one is given.
    #[must_use]
    pub fn from_request(
        request: &RequestContext,
        config: &FaultlineConfig,
        filter: Option<&dyn ParameterFilter>,
    ) -> Self {
        let apply_filter = |key: &String, value: &String| {
            let value = match filter {
                Some(filter) => filter.filter(key, value),
                None => value.clone(),
            };
            (key.clone(), value)
        };

        let env: IndexMap<_, _> = request
            .env
            .iter()
            .filter(|(key, _)| !config.skips_request_env(key))
            .map(|(key, value)| apply_filter(key, value))
            .collect();
        tracing::trace!(
            skipped = request.env.len() - env.len(),
            "sanitized request environment"
        );

        let params = request
            .query_params
            .iter()
            .chain(&request.body_params)
            .map(|(key, value)| apply_filter(key, value))
            .collect();

        Self { env, params }
    }

    /// Returns the environment value for `key`.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}
