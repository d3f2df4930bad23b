//! Faultline decides what happens when a web application raises an
//! exception.
//!
//! Given a captured [`ExceptionInfo`](exception::ExceptionInfo) and, if
//! there is one, the [`RequestContext`](request::RequestContext) it was
//! raised in, Faultline:
//!
//! - classifies the exception into an HTTP status code,
//! - decides whether anybody should be notified and whether the notification
//!   is sent right away or handed to a queue,
//! - composes the notification,
//! - finds the error page template to render.
//!
//! The [`ExceptionHandler`] runs all of these in order. Each step is also
//! available on its own in the [`policy`], [`notification`] and [`template`]
//! modules.
//!
//! Faultline does not send mail, render templates or run a queue itself.
//! Those are provided by the application through the
//! [`NotificationTransport`](notification::NotificationTransport),
//! [`NotificationQueue`](notification::NotificationQueue) and
//! [`TemplateFs`](template::TemplateFs) traits.
//!
//! # Examples
//!
//! ```
//! use faultline::config::FaultlineConfig;
//! use faultline::exception::{ExceptionInfo, TypeHierarchy};
//! use faultline::handler::{ExceptionHandler, HandleOptions};
//! use faultline::request::{Locality, RequestContext};
//! use faultline::StatusCode;
//!
//! let handler = ExceptionHandler::builder(FaultlineConfig::default()).build();
//! let hierarchy = TypeHierarchy::with_defaults();
//!
//! let exception = ExceptionInfo::new(hierarchy.lookup("RoutingError"), "no route matches /nope");
//! let request = RequestContext::new(Locality::Public).with_env("HTTP_HOST", "example.com");
//!
//! let outcome = handler.handle_exception(&exception, HandleOptions::new().request(request));
//! assert_eq!(outcome.status_code, Some(StatusCode::NOT_FOUND));
//! // 404 is not in the default `notify_status_codes`
//! assert!(!outcome.notified());
//! ```

pub mod handler;
mod log;
pub mod notification;
pub mod policy;
pub mod template;

pub use faultline_core::{Error, Result, StatusCode, classifier, config, exception, request};

pub use crate::handler::ExceptionHandler;
