//! Multi-line error logging.
//!
//! Exception reports are logged one line per event, so each line shows up
//! with its own timestamp and level in line-oriented log files.

use std::fmt::Display;

use faultline_core::StatusCode;
use faultline_core::exception::ExceptionInfo;
use faultline_core::request::RequestData;
use tracing::error;

pub(crate) fn log_error_lines<I>(lines: I)
where
    I: IntoIterator,
    I::Item: Display,
{
    for line in lines {
        error!("{line}");
    }
}

/// Logs a caught exception with everything known about it.
pub(crate) fn log_exception(
    exception: &ExceptionInfo,
    request_data: Option<&RequestData>,
    status_code: StatusCode,
    messages: &[String],
) {
    let mut lines = vec![
        format!("An exception was caught ({}):", exception.type_name()),
        exception.message().to_string(),
    ];
    lines.extend(messages.iter().filter(|message| !message.is_empty()).cloned());
    if let Some(request_data) = request_data {
        lines.push("Request params were:".to_string());
        lines.push(format!("{request_data:?}"));
    }
    lines.push(format!("Handling with status code: {status_code}"));
    if !exception.backtrace().is_empty() {
        lines.push(exception.backtrace().join("\n  "));
    }

    log_error_lines(lines);
}

/// Logs an error condition reported without an exception.
pub(crate) fn log_error_report(
    messages: &[String],
    backtrace: &[String],
    request_data: Option<&RequestData>,
) {
    let mut lines = vec![format!("{messages:?}")];
    if !backtrace.is_empty() {
        lines.push(backtrace.join("\n  "));
    }
    if let Some(request_data) = request_data {
        lines.push("Request params were:".to_string());
        lines.push(format!("{request_data:?}"));
    }

    log_error_lines(lines);
}

#[cfg(test)]
mod tests {
    use faultline_core::exception::TypeHierarchy;
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn exception_block() {
        let exception = ExceptionInfo::new(
            TypeHierarchy::with_defaults().lookup("ArgumentError"),
            "wrong number of arguments",
        )
        .with_backtrace(vec!["app/models/order.rs:12".to_string()]);

        log_exception(
            &exception,
            None,
            StatusCode::INTERNAL_SERVER_ERROR,
            &["while importing".to_string()],
        );

        assert!(logs_contain("An exception was caught (ArgumentError):"));
        assert!(logs_contain("wrong number of arguments"));
        assert!(logs_contain("while importing"));
        assert!(logs_contain("Handling with status code: 500"));
        assert!(logs_contain("app/models/order.rs:12"));
        assert!(!logs_contain("Request params were:"));
    }

    #[test]
    #[traced_test]
    fn error_report_block() {
        log_error_report(
            &["cache miss storm".to_string()],
            &[],
            Some(&RequestData::default()),
        );

        assert!(logs_contain("cache miss storm"));
        assert!(logs_contain("Request params were:"));
    }
}
