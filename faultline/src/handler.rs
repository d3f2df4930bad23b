//! The exception handler.
//!
//! [`ExceptionHandler`] ties the other modules together. For every exception
//! it sanitizes the request data, asks the supplementary-info hook for extra
//! context, classifies the exception, logs it, applies the notification
//! policy, delivers the notification and, if asked to, picks the error page
//! template.
//!
//! Handling never fails from the caller's point of view. Delivery errors and
//! panics raised while handling are logged and swallowed.

use std::any::Any;
use std::error::Error as StdError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use derive_more::with_trait::Debug;
use faultline_core::StatusCode;
use faultline_core::classifier::status_code_for;
use faultline_core::config::FaultlineConfig;
use faultline_core::exception::{ExceptionInfo, ExceptionType, ROOT_TYPE, TypeHierarchy};
use faultline_core::request::{ParameterFilter, RequestContext, RequestData};
use tracing::info;

use crate::log::{log_error_lines, log_error_report, log_exception};
use crate::notification::{
    LogTransport, NotificationContent, NotificationPayload, NotificationQueue,
    NotificationTransport, TransportError,
};
use crate::policy::{DeliveryMode, NotificationPolicy};
use crate::template::{LocalFs, ResolvedTemplate, ResponseFormat, TemplateFs, TemplateResolver};

const SUPPLEMENTARY_INFO_HEADER: &str = "Supplementary info:";

type SupplementaryInfoFn = dyn Fn(Option<&RequestContext>) -> Vec<String> + Send + Sync;

/// Options for a single [`ExceptionHandler`] call.
#[derive(Debug, Clone, Default)]
pub struct HandleOptions {
    request: Option<RequestContext>,
    render_errors: bool,
    proc_name: Option<String>,
    error_messages: Vec<String>,
    response_format: Option<ResponseFormat>,
    is_controller: bool,
    backtrace: Vec<String>,
}

impl HandleOptions {
    /// Creates options for an exception raised outside of any request, with
    /// no page rendering.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request the exception was raised in.
    #[must_use]
    pub fn request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    /// Whether to pick an error page template.
    #[must_use]
    pub fn render_errors(mut self, render_errors: bool) -> Self {
        self.render_errors = render_errors;
        self
    }

    /// Overrides the process name, which defaults to
    /// [`app_name`](FaultlineConfig::app_name).
    #[must_use]
    pub fn proc_name(mut self, proc_name: impl Into<String>) -> Self {
        self.proc_name = Some(proc_name.into());
        self
    }

    /// Adds a message to log and send along with the exception.
    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_messages.push(message.into());
        self
    }

    /// Sets the format of the error page. Defaults to the format named by the
    /// request's `Accept` header, or HTML.
    #[must_use]
    pub fn response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = Some(response_format);
        self
    }

    /// Whether the caller is a request controller, which selects between
    /// [`async_for_controller_errors`] and
    /// [`async_for_non_controller_errors`].
    ///
    /// [`async_for_controller_errors`]: FaultlineConfig::async_for_controller_errors
    /// [`async_for_non_controller_errors`]: FaultlineConfig::async_for_non_controller_errors
    #[must_use]
    pub fn controller(mut self, is_controller: bool) -> Self {
        self.is_controller = is_controller;
        self
    }

    /// Sets the call stack for error reports that have no exception.
    #[must_use]
    pub fn backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    fn effective_response_format(&self) -> ResponseFormat {
        self.response_format
            .or_else(|| {
                self.request
                    .as_ref()?
                    .env_value("HTTP_ACCEPT")
                    .map(ResponseFormat::from_format)
            })
            .unwrap_or(ResponseFormat::Html)
    }
}

/// What happened to the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationStatus {
    /// The policy decided not to notify.
    NotSent,
    /// The policy decided to notify, but no sender or recipients are
    /// configured.
    Undeliverable,
    /// The notification was handed to the transport or the queue.
    Delivered(DeliveryMode),
    /// Synchronous delivery failed temporarily and the notification was
    /// handed to the queue instead.
    Requeued,
    /// Delivery failed, or handling was aborted by a panic.
    Failed,
}

/// The result of handling an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    /// The status code the exception was classified as; `None` for error
    /// reports without an exception.
    pub status_code: Option<StatusCode>,
    /// What happened to the notification.
    pub notification: NotificationStatus,
    /// The error page template, when rendering was requested and one was
    /// found.
    pub template: Option<ResolvedTemplate>,
}

impl HandleOutcome {
    /// Returns `true` if a notification was sent or queued.
    #[must_use]
    pub fn notified(&self) -> bool {
        matches!(
            self.notification,
            NotificationStatus::Delivered(_) | NotificationStatus::Requeued
        )
    }
}

/// Handles exceptions according to a [`FaultlineConfig`].
///
/// The handler is cheap to clone and can be shared between threads.
///
/// # Examples
///
/// ```
/// use faultline::config::{FaultlineConfig, NotifierConfig};
/// use faultline::handler::{ExceptionHandler, HandleOptions, NotificationStatus};
/// use faultline::notification::LogTransport;
/// use faultline::policy::DeliveryMode;
///
/// let config = FaultlineConfig::builder()
///     .app_name("importer")
///     .notifier(
///         NotifierConfig::builder()
///             .from_address("errors@example.com")
///             .recipient_addresses(vec!["oncall@example.com".to_string()])
///             .build(),
///     )
///     .build();
/// let handler = ExceptionHandler::builder(config)
///     .transport(LogTransport)
///     .supplementary_info(|_request| vec!["batch 17".to_string()])
///     .build();
///
/// let outcome = handler.handle_error(["import stalled"], HandleOptions::new());
/// assert_eq!(
///     outcome.notification,
///     NotificationStatus::Delivered(DeliveryMode::Sync)
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    config: Arc<FaultlineConfig>,
    hierarchy: Arc<TypeHierarchy>,
    #[debug("..")]
    transport: Arc<dyn NotificationTransport>,
    #[debug("..")]
    queue: Option<Arc<dyn NotificationQueue>>,
    #[debug("..")]
    template_fs: Arc<dyn TemplateFs>,
    #[debug("..")]
    parameter_filter: Option<Arc<dyn ParameterFilter>>,
    #[debug("..")]
    supplementary_info: Option<Arc<SupplementaryInfoFn>>,
}

impl ExceptionHandler {
    /// Creates a builder for a handler using `config`.
    pub fn builder(config: FaultlineConfig) -> ExceptionHandlerBuilder {
        ExceptionHandlerBuilder::new(config)
    }

    /// The configuration the handler was built with.
    #[must_use]
    pub fn config(&self) -> &FaultlineConfig {
        &self.config
    }

    /// The type hierarchy used for errors captured by
    /// [`notify_on_error`](Self::notify_on_error).
    #[must_use]
    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    /// The notification policy for the handler's configuration.
    #[must_use]
    pub fn policy(&self) -> NotificationPolicy<'_> {
        NotificationPolicy::new(&self.config)
    }

    /// A template resolver reading from the handler's template file system.
    #[must_use]
    pub fn template_resolver(&self) -> TemplateResolver<'_> {
        TemplateResolver::new(&self.config, self.template_fs.as_ref())
    }

    /// Classifies `exception`, see [`status_code_for`].
    #[must_use]
    pub fn status_code_for(&self, exception: &ExceptionInfo) -> StatusCode {
        status_code_for(exception, &self.config.error_class_status_codes)
    }

    /// Handles a caught exception.
    pub fn handle_exception(
        &self,
        exception: &ExceptionInfo,
        options: HandleOptions,
    ) -> HandleOutcome {
        self.handle_guarded(Some(exception), &options)
    }

    /// Reports an error condition that did not raise an exception.
    ///
    /// The first message becomes the notification message and the rest are
    /// sent along as extra messages. The exception gate of the notification
    /// policy is skipped.
    pub fn handle_error<I, S>(&self, messages: I, mut options: HandleOptions) -> HandleOutcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut error_messages: Vec<String> = messages.into_iter().map(Into::into).collect();
        error_messages.append(&mut options.error_messages);
        options.error_messages = error_messages;

        self.handle_guarded(None, &options)
    }

    /// Handles an exception the application already turned into a response.
    ///
    /// Nothing is rendered. Returns `None` without doing anything when
    /// handling is disabled for the request's locality.
    pub fn handle_rescued(
        &self,
        exception: &ExceptionInfo,
        request: RequestContext,
    ) -> Option<HandleOutcome> {
        if !self.policy().should_handle(request.locality()) {
            return None;
        }

        let options = HandleOptions::new()
            .request(request)
            .controller(true)
            .render_errors(false);
        Some(self.handle_exception(exception, options))
    }

    /// Runs `f`, handling the error it returns, if any.
    ///
    /// Returns the value produced by `f`, or `None` if it failed.
    ///
    /// ```
    /// use faultline::config::FaultlineConfig;
    /// use faultline::handler::ExceptionHandler;
    ///
    /// let handler = ExceptionHandler::builder(FaultlineConfig::default()).build();
    ///
    /// let port = handler.notify_on_error(Some("config-loader"), None, || "80".parse::<u16>());
    /// assert_eq!(port, Some(80));
    ///
    /// let port = handler.notify_on_error(Some("config-loader"), None, || "http".parse::<u16>());
    /// assert_eq!(port, None);
    /// ```
    pub fn notify_on_error<T, E, F>(
        &self,
        proc_name: Option<&str>,
        message: Option<&str>,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: StdError + 'static,
    {
        match f() {
            Ok(value) => Some(value),
            Err(err) => {
                let exception = ExceptionInfo::from_error(&err, &self.hierarchy);
                let mut options = HandleOptions::new();
                if let Some(proc_name) = proc_name {
                    options = options.proc_name(proc_name);
                }
                if let Some(message) = message {
                    options = options.error_message(message);
                }
                self.handle_exception(&exception, options);
                None
            }
        }
    }

    fn handle_guarded(
        &self,
        exception: Option<&ExceptionInfo>,
        options: &HandleOptions,
    ) -> HandleOutcome {
        match catch_unwind(AssertUnwindSafe(|| self.handle(exception, options))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                log_error_lines([
                    "/!\\ FAILSAFE /!\\ encountered an unhandled failure while trying to \
                     handle an error. The arguments it received were:"
                        .to_string(),
                    format!("  exception: {exception:?}"),
                    format!("  options: {options:?}"),
                    "The unhandled failure was:".to_string(),
                    format!("  {}", panic_message(&*payload)),
                ]);
                HandleOutcome {
                    status_code: exception.map(|exception| self.status_code_for(exception)),
                    notification: NotificationStatus::Failed,
                    template: None,
                }
            }
        }
    }

    fn handle(&self, exception: Option<&ExceptionInfo>, options: &HandleOptions) -> HandleOutcome {
        let request = options.request.as_ref();
        let proc_name = options
            .proc_name
            .as_deref()
            .unwrap_or(&self.config.app_name);
        let request_data = request.map(|request| {
            RequestData::from_request(request, &self.config, self.parameter_filter.as_deref())
        });

        let supplementary_info = self
            .supplementary_info
            .as_ref()
            .map(|hook| hook(request))
            .unwrap_or_default();
        let mut messages = options.error_messages.clone();
        // an error report leads with its first message, or an empty one
        let report_message = match exception {
            None if !messages.is_empty() => messages.remove(0),
            _ => String::new(),
        };
        if !supplementary_info.is_empty() {
            messages.push(SUPPLEMENTARY_INFO_HEADER.to_string());
            messages.extend(supplementary_info.iter().cloned());
        }

        let (status_code, message, backtrace) = match exception {
            Some(exception) => {
                let status_code = self.status_code_for(exception);
                log_exception(exception, request_data.as_ref(), status_code, &messages);
                (
                    Some(status_code),
                    exception.message().to_string(),
                    exception.backtrace().to_vec(),
                )
            }
            None => {
                let mut report = vec![report_message.clone()];
                report.extend(messages.iter().cloned());
                log_error_report(&report, &options.backtrace, request_data.as_ref());
                (None, report_message, options.backtrace.clone())
            }
        };

        let notification = if self.policy().should_notify(exception, status_code, request) {
            let mut content = NotificationContent::builder();
            content
                .message(message)
                .extra_messages(messages)
                .proc_name(proc_name)
                .backtrace(backtrace)
                .supplementary_info(supplementary_info)
                .notifier(&self.config.notifier);
            if let Some(exception) = exception {
                content.exception_type(exception.type_name());
            }
            if let Some(status_code) = status_code {
                content.status_code(status_code);
            }
            if let Some(request_data) = request_data {
                content.request_data(request_data);
            }
            self.deliver(content.build(), exception, options)
        } else {
            NotificationStatus::NotSent
        };

        let template = if options.render_errors {
            self.resolve_template(exception, status_code, options.effective_response_format())
        } else {
            None
        };

        HandleOutcome {
            status_code,
            notification,
            template,
        }
    }

    fn deliver(
        &self,
        content: NotificationContent,
        exception: Option<&ExceptionInfo>,
        options: &HandleOptions,
    ) -> NotificationStatus {
        if !self.config.notifier.is_deliverable() {
            info!("not sending notification: no from address or recipient addresses configured");
            return NotificationStatus::Undeliverable;
        }

        let payload = NotificationPayload::new(content);
        let mode = self
            .policy()
            .delivery_mode(options.is_controller, self.queue.is_some());
        match (mode, &self.queue) {
            (DeliveryMode::Async, Some(queue)) => {
                info!("sending notification asynchronously");
                match queue.enqueue(payload.into_queued()) {
                    Ok(()) => NotificationStatus::Delivered(DeliveryMode::Async),
                    Err(err) => {
                        log_delivery_failure(&err, exception, options);
                        NotificationStatus::Failed
                    }
                }
            }
            _ => {
                info!("sending notification synchronously");
                let payload = match &options.request {
                    Some(request) => payload.with_request(request.clone()),
                    None => payload,
                };
                match self.transport.deliver(&payload) {
                    Ok(()) => NotificationStatus::Delivered(DeliveryMode::Sync),
                    Err(err) => self.requeue(payload, &err, exception, options),
                }
            }
        }
    }

    fn requeue(
        &self,
        payload: NotificationPayload,
        err: &TransportError,
        exception: Option<&ExceptionInfo>,
        options: &HandleOptions,
    ) -> NotificationStatus {
        let Some(queue) = self.queue.as_ref().filter(|_| err.is_transient()) else {
            log_delivery_failure(err, exception, options);
            return NotificationStatus::Failed;
        };

        log_error_lines([
            format!("failed to send error notification: {err}"),
            "attempting to send via the queue".to_string(),
        ]);
        match queue.enqueue(payload.into_queued()) {
            Ok(()) => NotificationStatus::Requeued,
            Err(retry_err) => {
                log_delivery_failure(&retry_err, exception, options);
                NotificationStatus::Failed
            }
        }
    }

    fn resolve_template(
        &self,
        exception: Option<&ExceptionInfo>,
        status_code: Option<StatusCode>,
        format: ResponseFormat,
    ) -> Option<ResolvedTemplate> {
        let exception_type = exception.map_or_else(
            || ExceptionType::unregistered(ROOT_TYPE),
            |exception| exception.exception_type().clone(),
        );
        let status_code = status_code.unwrap_or(self.config.error_class_status_codes.default);

        self.template_resolver()
            .resolve_or_fallback(&exception_type, status_code, format)
    }
}

fn log_delivery_failure(
    err: &TransportError,
    exception: Option<&ExceptionInfo>,
    options: &HandleOptions,
) {
    log_error_lines([
        "/!\\ FAILSAFE /!\\ could not deliver the error notification. The arguments it \
         received were:"
            .to_string(),
        format!("  exception: {exception:?}"),
        format!("  options: {options:?}"),
        "The error encountered was:".to_string(),
        format!("  {err}"),
    ]);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Builder for [`ExceptionHandler`].
#[derive(Debug)]
#[must_use]
pub struct ExceptionHandlerBuilder {
    config: FaultlineConfig,
    hierarchy: TypeHierarchy,
    #[debug("..")]
    transport: Arc<dyn NotificationTransport>,
    #[debug("..")]
    queue: Option<Arc<dyn NotificationQueue>>,
    #[debug("..")]
    template_fs: Arc<dyn TemplateFs>,
    #[debug("..")]
    parameter_filter: Option<Arc<dyn ParameterFilter>>,
    #[debug("..")]
    supplementary_info: Option<Arc<SupplementaryInfoFn>>,
}

impl ExceptionHandlerBuilder {
    fn new(config: FaultlineConfig) -> Self {
        Self {
            config,
            hierarchy: TypeHierarchy::with_defaults(),
            transport: Arc::new(LogTransport),
            queue: None,
            template_fs: Arc::new(LocalFs),
            parameter_filter: None,
            supplementary_info: None,
        }
    }

    /// Sets the type hierarchy. Defaults to
    /// [`TypeHierarchy::with_defaults`].
    pub fn hierarchy(mut self, hierarchy: TypeHierarchy) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    /// Sets the transport for synchronous delivery. Defaults to
    /// [`LogTransport`].
    pub fn transport<T: NotificationTransport + 'static>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Sets the queue for asynchronous delivery. Without one, every
    /// notification is delivered synchronously.
    pub fn queue<Q: NotificationQueue + 'static>(mut self, queue: Q) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    /// Sets the file system templates are looked up in. Defaults to
    /// [`LocalFs`].
    pub fn template_fs<F: TemplateFs + 'static>(mut self, template_fs: F) -> Self {
        self.template_fs = Arc::new(template_fs);
        self
    }

    /// Sets the filter masking sensitive request values.
    pub fn parameter_filter<P: ParameterFilter + 'static>(mut self, filter: P) -> Self {
        self.parameter_filter = Some(Arc::new(filter));
        self
    }

    /// Sets a hook returning extra lines to log and send with every
    /// notification.
    pub fn supplementary_info<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&RequestContext>) -> Vec<String> + Send + Sync + 'static,
    {
        self.supplementary_info = Some(Arc::new(hook));
        self
    }

    /// Builds the handler.
    #[must_use]
    pub fn build(self) -> ExceptionHandler {
        ExceptionHandler {
            config: Arc::new(self.config),
            hierarchy: Arc::new(self.hierarchy),
            transport: self.transport,
            queue: self.queue,
            template_fs: self.template_fs,
            parameter_filter: self.parameter_filter,
            supplementary_info: self.supplementary_info,
        }
    }
}
