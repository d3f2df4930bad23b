//! Deciding whether to handle an exception, whether to notify about it, and
//! how to deliver the notification.
//!
//! Notification goes through three gates, in order:
//!
//! 1. the context gate ([`NotificationPolicy::notify_in_context`]), which
//!    looks only at where the exception happened,
//! 2. the exception gate ([`NotificationPolicy::notify_on_exception`]), which
//!    looks at the exception type and its status code and is skipped for
//!    explicit error reports that carry no exception,
//! 3. the header-block gate ([`NotificationPolicy::blocking_rule`]), which
//!    can veto notification for requests matching a configured pattern.
//!
//! A gate that vetoes logs the reason.

use derive_more::Display;
use faultline_core::StatusCode;
use faultline_core::config::{FaultlineConfig, HeaderBlockRule};
use faultline_core::exception::ExceptionInfo;
use faultline_core::request::{Locality, RequestContext};
use tracing::error;

/// How a notification is delivered.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Delivered through the transport before the handler returns.
    #[display("synchronously")]
    Sync,
    /// Handed to the queue.
    #[display("asynchronously")]
    Async,
}

/// The notification rules of a [`FaultlineConfig`].
///
/// # Examples
///
/// ```
/// use faultline::config::FaultlineConfig;
/// use faultline::exception::{ExceptionInfo, TypeHierarchy};
/// use faultline::policy::NotificationPolicy;
/// use faultline::request::{Locality, RequestContext};
/// use faultline::StatusCode;
///
/// let config = FaultlineConfig::default();
/// let policy = NotificationPolicy::new(&config);
/// let exception = ExceptionInfo::new(TypeHierarchy::with_defaults().lookup("RuntimeError"), "boom");
///
/// let public = RequestContext::new(Locality::Public);
/// let local = RequestContext::new(Locality::Local);
///
/// let status = Some(StatusCode::INTERNAL_SERVER_ERROR);
/// assert!(policy.should_notify(Some(&exception), status, Some(&public)));
/// assert!(!policy.should_notify(Some(&exception), status, Some(&local)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NotificationPolicy<'a> {
    config: &'a FaultlineConfig,
}

impl<'a> NotificationPolicy<'a> {
    /// Creates the policy for `config`.
    #[must_use]
    pub fn new(config: &'a FaultlineConfig) -> Self {
        Self { config }
    }

    /// Returns `true` if exceptions from requests of `locality` are handled
    /// at all.
    #[must_use]
    pub fn should_handle(&self, locality: Locality) -> bool {
        match locality {
            Locality::Local => self.config.handle_local_errors,
            Locality::Public => self.config.handle_public_errors,
        }
    }

    /// The context gate.
    ///
    /// With a request, notifies according to `notify_on_local_error` or
    /// `notify_on_public_error`. Without one, the exception happened in the
    /// background and `notify_on_background_error` decides.
    #[must_use]
    pub fn notify_in_context(&self, request: Option<&RequestContext>) -> bool {
        match request.map(RequestContext::locality) {
            Some(Locality::Local) => self.config.notify_on_local_error,
            Some(Locality::Public) => self.config.notify_on_public_error,
            None => self.config.notify_on_background_error,
        }
    }

    /// The exception gate, combined with the context gate.
    ///
    /// Passes when the context gate passes and either the exception's type is
    /// listed in `notify_exception_classes` or `status_code` is listed in
    /// `notify_status_codes`. Only the concrete type is compared.
    #[must_use]
    pub fn notify_on_exception(
        &self,
        exception: &ExceptionInfo,
        status_code: Option<StatusCode>,
        request: Option<&RequestContext>,
    ) -> bool {
        self.notify_in_context(request)
            && (self
                .config
                .notify_exception_classes
                .iter()
                .any(|name| name == exception.type_name())
                || status_code.is_some_and(|code| self.config.notify_status_codes.contains(&code)))
    }

    /// Returns the first header-block rule that matches `request`.
    ///
    /// A rule matches when its header is present in the environment, the
    /// query parameters or the body parameters with a value the rule's
    /// pattern matches.
    #[must_use]
    pub fn blocking_rule(&self, request: &RequestContext) -> Option<&'a HeaderBlockRule> {
        self.config
            .block_notify_on_request_headers
            .iter()
            .find(|rule| request.values(&rule.header).any(|value| rule.blocks(value)))
    }

    /// Decides whether a notification is sent.
    ///
    /// `exception` is `None` for explicit error reports, which skip the
    /// exception gate.
    #[must_use]
    pub fn should_notify(
        &self,
        exception: Option<&ExceptionInfo>,
        status_code: Option<StatusCode>,
        request: Option<&RequestContext>,
    ) -> bool {
        if !self.notify_in_context(request) {
            error!("will not notify: not configured to notify in this context");
            return false;
        }

        if let Some(exception) = exception
            && !self.notify_on_exception(exception, status_code, request)
        {
            error!(
                exception_type = exception.type_name(),
                status_code = status_code.map(|code| code.as_u16()),
                "will not notify: not configured to notify for this exception or status code"
            );
            return false;
        }

        if let Some(request) = request
            && let Some(rule) = self.blocking_rule(request)
        {
            error!(
                header = rule.header.as_str(),
                pattern = rule.pattern.as_str(),
                "will not notify: request blocked by block_notify_on_request_headers"
            );
            return false;
        }

        true
    }

    /// Picks the delivery mode.
    ///
    /// Delivery is asynchronous only when a queue is available and the
    /// toggle for the caller's context (`async_for_controller_errors` or
    /// `async_for_non_controller_errors`) is on.
    #[must_use]
    pub fn delivery_mode(&self, is_controller: bool, async_available: bool) -> DeliveryMode {
        let enabled = if is_controller {
            self.config.async_for_controller_errors
        } else {
            self.config.async_for_non_controller_errors
        };

        if enabled && async_available {
            DeliveryMode::Async
        } else {
            DeliveryMode::Sync
        }
    }
}
