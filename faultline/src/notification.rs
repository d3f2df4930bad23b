//! Composing and delivering notifications.
//!
//! A notification is assembled with [`NotificationContent::builder`]. For
//! synchronous delivery it is wrapped, together with the raw request, in a
//! [`NotificationPayload`] and handed to a [`NotificationTransport`]. For
//! asynchronous delivery it is wrapped in a [`QueuedNotification`], which has
//! no room for the raw request, and handed to a [`NotificationQueue`].

use std::fmt::Write;

use derive_builder::Builder;
use derive_more::Deref;
use faultline_core::StatusCode;
use faultline_core::config::NotifierConfig;
use faultline_core::request::{RequestContext, RequestData};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const ERROR_PREFIX: &str = "notification transport error:";
const SECTION_RULE: &str = "-------------------------------";
const FAIL_MSG: &str = "Failed to write notification text";

/// An error that can occur while delivering a notification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// A temporary failure, such as an authentication hiccup or a busy mail
    /// server. The notification may succeed if it is retried later.
    #[error("{ERROR_PREFIX} temporary failure: {0}")]
    Transient(String),
    /// A permanent failure.
    #[error("{ERROR_PREFIX} delivery failed: {0}")]
    Failed(String),
    /// The notification could not be serialized for the queue.
    #[error("{ERROR_PREFIX} could not serialize the notification: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` for [`TransportError::Transient`].
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A type alias for results of delivering a notification.
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends notifications right away.
pub trait NotificationTransport: Send + Sync {
    /// Delivers `payload`, blocking until it is sent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transient`] for failures worth retrying and
    /// [`TransportError::Failed`] for the rest.
    fn deliver(&self, payload: &NotificationPayload) -> TransportResult<()>;
}

/// Hands notifications to a background job queue.
pub trait NotificationQueue: Send + Sync {
    /// Enqueues `notification` for later delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue does not accept the notification.
    fn enqueue(&self, notification: QueuedNotification) -> TransportResult<()>;
}

/// A [`NotificationTransport`] that writes notifications to the log.
///
/// Useful in development, where no mail server is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

impl NotificationTransport for LogTransport {
    fn deliver(&self, payload: &NotificationPayload) -> TransportResult<()> {
        info!(
            from = payload.from_address(),
            to = ?payload.recipient_addresses(),
            subject = payload.subject(),
            "{}",
            payload.body_text()
        );
        Ok(())
    }
}

/// The data of a notification.
///
/// # Examples
///
/// ```
/// use faultline::config::NotifierConfig;
/// use faultline::notification::NotificationContent;
/// use faultline::StatusCode;
///
/// let notifier = NotifierConfig::builder().subject_prefix("PRODUCTION ERROR").build();
/// let content = NotificationContent::builder()
///     .exception_type("Billing::CardDeclined")
///     .message("card \"4242\" declined")
///     .proc_name("billing")
///     .status_code(StatusCode::INTERNAL_SERVER_ERROR)
///     .notifier(&notifier)
///     .build();
///
/// assert_eq!(
///     content.subject(),
///     r#"[billing PRODUCTION ERROR] Billing::CardDeclined: "card \"4242\" declined""#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(skip, error = std::convert::Infallible))]
pub struct NotificationContent {
    /// The exception type name; `None` for explicit error reports.
    #[builder(setter(into, strip_option))]
    exception_type: Option<String>,
    #[builder(setter(into))]
    message: String,
    extra_messages: Vec<String>,
    #[builder(setter(into))]
    proc_name: String,
    backtrace: Vec<String>,
    supplementary_info: Vec<String>,
    #[builder(setter(strip_option))]
    status_code: Option<StatusCode>,
    #[builder(setter(strip_option))]
    request_data: Option<RequestData>,
    #[builder(setter(into))]
    from_address: String,
    recipient_addresses: Vec<String>,
    #[builder(setter(into))]
    subject_prefix: String,
    #[builder(setter(skip))]
    host: Option<String>,
    #[builder(setter(skip))]
    protocol: Option<String>,
    #[builder(setter(skip))]
    uri: Option<String>,
}

impl NotificationContent {
    /// Creates a new [`NotificationContentBuilder`].
    #[must_use]
    pub fn builder() -> NotificationContentBuilder {
        NotificationContentBuilder::default()
    }

    /// The exception type name, if the notification is about an exception.
    #[must_use]
    pub fn exception_type(&self) -> Option<&str> {
        self.exception_type.as_deref()
    }

    /// The main message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Additional messages, including the supplementary info section.
    #[must_use]
    pub fn extra_messages(&self) -> &[String] {
        &self.extra_messages
    }

    /// The name of the process the exception was raised in.
    #[must_use]
    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    /// The call stack, one frame per line.
    #[must_use]
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }

    /// The lines returned by the supplementary-info hook.
    #[must_use]
    pub fn supplementary_info(&self) -> &[String] {
        &self.supplementary_info
    }

    /// The status code the exception was classified as.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status_code
    }

    /// The sanitized request data, if the exception was raised in a request.
    #[must_use]
    pub fn request_data(&self) -> Option<&RequestData> {
        self.request_data.as_ref()
    }

    /// The sender address.
    #[must_use]
    pub fn from_address(&self) -> &str {
        &self.from_address
    }

    /// The recipient addresses.
    #[must_use]
    pub fn recipient_addresses(&self) -> &[String] {
        &self.recipient_addresses
    }

    /// The client host: the first of `HTTP_X_REAL_IP`,
    /// `HTTP_X_FORWARDED_HOST` and `HTTP_HOST` present in the request data.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// The `SERVER_PROTOCOL` of the request.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The `REQUEST_URI` of the request.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// The subject line, `[<proc name> <prefix>] <type>: "<message>"`.
    ///
    /// The space after the process name is left out when it is empty, and so
    /// is the type when there is none.
    #[must_use]
    pub fn subject(&self) -> String {
        let mut subject = String::from("[");
        if !self.proc_name.is_empty() {
            subject.push_str(&self.proc_name);
            subject.push(' ');
        }
        subject.push_str(&self.subject_prefix);
        subject.push_str("] ");
        if let Some(exception_type) = &self.exception_type {
            subject.push_str(exception_type);
            subject.push_str(": ");
        }
        write!(subject, "{:?}", self.message).expect(FAIL_MSG);
        subject
    }

    /// Renders the plain-text body.
    #[must_use]
    pub fn body_text(&self) -> String {
        let mut body = String::new();

        match &self.exception_type {
            Some(exception_type) => {
                writeln!(body, "A {exception_type} occurred in {}:", self.proc_name)
                    .expect(FAIL_MSG);
            }
            None => {
                writeln!(body, "An error was reported in {}:", self.proc_name)
                    .expect(FAIL_MSG);
            }
        }
        body.push('\n');
        writeln!(body, "  {}", self.message).expect(FAIL_MSG);
        for message in &self.extra_messages {
            writeln!(body, "  {message}").expect(FAIL_MSG);
        }
        if let Some(status_code) = self.status_code {
            writeln!(
                body,
                "\nHandled with status code {status_code} ({})",
                status_code.reason_phrase()
            )
            .expect(FAIL_MSG);
        }

        if let Some(request_data) = &self.request_data {
            push_section(&mut body, "Request");
            for (label, value) in [
                ("URI", &self.uri),
                ("Host", &self.host),
                ("Protocol", &self.protocol),
            ] {
                if let Some(value) = value {
                    writeln!(body, "  * {label}: {value}").expect(FAIL_MSG);
                }
            }

            push_section(&mut body, "Request data");
            for (key, value) in &request_data.env {
                writeln!(body, "  * {key}: {value}").expect(FAIL_MSG);
            }
            if !request_data.params.is_empty() {
                body.push_str("  * params:\n");
                for (key, value) in &request_data.params {
                    writeln!(body, "    * {key}: {value}").expect(FAIL_MSG);
                }
            }
        }

        if !self.backtrace.is_empty() {
            push_section(&mut body, "Backtrace");
            for frame in &self.backtrace {
                writeln!(body, "  {frame}").expect(FAIL_MSG);
            }
        }

        body
    }
}

fn push_section(body: &mut String, title: &str) {
    write!(body, "\n{SECTION_RULE}\n{title}:\n{SECTION_RULE}\n\n").expect(FAIL_MSG);
}

impl NotificationContentBuilder {
    /// Copies the envelope settings from `notifier`.
    pub fn notifier(&mut self, notifier: &NotifierConfig) -> &mut Self {
        self.from_address = Some(notifier.from_address.clone());
        self.recipient_addresses = Some(notifier.recipient_addresses.clone());
        self.subject_prefix = Some(notifier.subject_prefix.clone());
        self
    }

    /// Builds the notification, extracting the host, protocol and URI from
    /// the request data.
    #[must_use]
    pub fn build(&self) -> NotificationContent {
        let request_data = self.request_data.clone().flatten();
        let env_value = |key: &str| {
            request_data
                .as_ref()
                .and_then(|data| data.env_value(key))
                .map(ToString::to_string)
        };
        let host = env_value("HTTP_X_REAL_IP")
            .or_else(|| env_value("HTTP_X_FORWARDED_HOST"))
            .or_else(|| env_value("HTTP_HOST"));
        let protocol = env_value("SERVER_PROTOCOL");
        let uri = env_value("REQUEST_URI");

        NotificationContent {
            exception_type: self.exception_type.clone().flatten(),
            message: self.message.clone().unwrap_or_default(),
            extra_messages: self.extra_messages.clone().unwrap_or_default(),
            proc_name: self.proc_name.clone().unwrap_or_default(),
            backtrace: self.backtrace.clone().unwrap_or_default(),
            supplementary_info: self.supplementary_info.clone().unwrap_or_default(),
            status_code: self.status_code.flatten(),
            from_address: self.from_address.clone().unwrap_or_default(),
            recipient_addresses: self.recipient_addresses.clone().unwrap_or_default(),
            subject_prefix: self
                .subject_prefix
                .clone()
                .unwrap_or_else(|| NotifierConfig::default().subject_prefix),
            request_data,
            host,
            protocol,
            uri,
        }
    }
}

/// A notification for synchronous delivery.
///
/// Besides the [`NotificationContent`], it may carry the raw request the
/// exception was raised in, so that a transport can include details the
/// sanitized request data leaves out.
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct NotificationPayload {
    #[deref]
    content: NotificationContent,
    request: Option<RequestContext>,
}

impl NotificationPayload {
    /// Creates a payload without a raw request.
    #[must_use]
    pub fn new(content: NotificationContent) -> Self {
        Self {
            content,
            request: None,
        }
    }

    /// Attaches the raw request.
    #[must_use]
    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    /// The raw request, if one is attached.
    #[must_use]
    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }

    /// The notification data.
    #[must_use]
    pub fn content(&self) -> &NotificationContent {
        &self.content
    }

    /// Drops the raw request, turning the payload into one that can be
    /// queued.
    #[must_use]
    pub fn into_queued(self) -> QueuedNotification {
        QueuedNotification {
            content: self.content,
        }
    }
}

/// A notification handed to a [`NotificationQueue`].
///
/// Never carries the raw request; serializes to JSON for storage in a job
/// queue.
#[derive(Debug, Clone, PartialEq, Eq, Deref, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueuedNotification {
    content: NotificationContent,
}

impl QueuedNotification {
    /// Serializes the notification to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if serialization fails.
    pub fn to_json(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a notification previously serialized with
    /// [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if `json` is not a valid
    /// notification.
    pub fn from_json(json: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The notification data.
    #[must_use]
    pub fn content(&self) -> &NotificationContent {
        &self.content
    }

    /// Turns the notification back into a payload, for a queue worker to
    /// pass to a [`NotificationTransport`].
    #[must_use]
    pub fn into_payload(self) -> NotificationPayload {
        NotificationPayload::new(self.content)
    }
}
