use faultline::config::{FaultlineConfig, FaultlineConfigBuilder, HeaderBlockRule, NotifierConfig};
use faultline::exception::{ExceptionInfo, TypeHierarchy};
use faultline::handler::{ExceptionHandler, HandleOptions, NotificationStatus};
use faultline::notification::{
    NotificationPayload, NotificationQueue, NotificationTransport, QueuedNotification,
    TransportError, TransportResult,
};
use faultline::policy::DeliveryMode;
use faultline::request::{FilterKeys, Locality, RequestContext};
use faultline::template::{ResponseFormat, TemplateSource};
use faultline::StatusCode;
use mockall::mock;
use tempfile::TempDir;
use tracing_test::traced_test;

mock! {
    pub Transport {}

    impl NotificationTransport for Transport {
        fn deliver(&self, payload: &NotificationPayload) -> TransportResult<()>;
    }
}

mock! {
    pub Queue {}

    impl NotificationQueue for Queue {
        fn enqueue(&self, notification: QueuedNotification) -> TransportResult<()>;
    }
}

fn config() -> FaultlineConfigBuilder {
    let mut builder = FaultlineConfig::builder();
    builder.app_name("shop").notifier(
        NotifierConfig::builder()
            .from_address("errors@shop.example.com")
            .recipient_addresses(vec!["oncall@shop.example.com".to_string()])
            .build(),
    );
    builder
}

fn exception(name: &str, message: &str) -> ExceptionInfo {
    ExceptionInfo::new(TypeHierarchy::with_defaults().lookup(name), message)
}

/// Checks that the failsafe block names the original exception, the options
/// and the delivery error.
fn failsafe_block_mentions(lines: &[&str], message: &str, error: &str) -> Result<(), String> {
    let start = lines
        .iter()
        .position(|line| line.contains("FAILSAFE"))
        .ok_or("no failsafe block was logged")?;
    let block = &lines[start..];

    if !block
        .iter()
        .any(|line| line.contains("exception: Some(") && line.contains(message))
    {
        return Err(format!("failsafe block does not mention {message:?}"));
    }
    if !block.iter().any(|line| line.contains("options: HandleOptions")) {
        return Err("failsafe block does not mention the options".to_string());
    }
    if !block.iter().any(|line| line.contains(error)) {
        return Err(format!("failsafe block does not mention {error:?}"));
    }
    Ok(())
}

fn transport_expecting(times: usize) -> MockTransport {
    let mut transport = MockTransport::new();
    transport.expect_deliver().times(times).returning(|_| Ok(()));
    transport
}

#[test]
fn local_requests_do_not_notify_public_ones_do() {
    let handler = ExceptionHandler::builder(
        config()
            .notify_on_local_error(false)
            .notify_on_public_error(true)
            .build(),
    )
    .transport(transport_expecting(1))
    .build();
    let error = exception("RuntimeError", "boom");

    let local = handler.handle_exception(
        &error,
        HandleOptions::new().request(RequestContext::new(Locality::Local)),
    );
    let public = handler.handle_exception(
        &error,
        HandleOptions::new().request(RequestContext::new(Locality::Public)),
    );

    assert_eq!(local.notification, NotificationStatus::NotSent);
    assert_eq!(
        public.notification,
        NotificationStatus::Delivered(DeliveryMode::Sync)
    );
}

#[test]
#[traced_test]
fn header_block_suppresses_notification() {
    let handler = ExceptionHandler::builder(
        config()
            .block_notify_on_header(HeaderBlockRule::new("HTTP_USER_AGENT", "(?i)googlebot").unwrap())
            .build(),
    )
    .transport(transport_expecting(0))
    .build();
    let request = RequestContext::new(Locality::Public)
        .with_env("HTTP_USER_AGENT", "Mozilla/5.0 (compatible; Googlebot/2.1)");

    let outcome = handler.handle_exception(
        &exception("RuntimeError", "boom"),
        HandleOptions::new().request(request),
    );

    assert_eq!(outcome.notification, NotificationStatus::NotSent);
    assert!(logs_contain("will not notify"));
}

#[test]
fn status_codes_outside_the_notify_list_do_not_notify() {
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport_expecting(0))
        .build();

    let outcome = handler.handle_exception(
        &exception("RecordNotFound", "no such order"),
        HandleOptions::new(),
    );

    assert_eq!(outcome.status_code, Some(StatusCode::BAD_REQUEST));
    assert!(!outcome.notified());
}

#[test]
fn notify_exception_classes_override_status_codes() {
    let handler = ExceptionHandler::builder(
        config()
            .notify_exception_classes(vec!["RecordNotFound".to_string()])
            .build(),
    )
    .transport(transport_expecting(1))
    .build();

    let outcome = handler.handle_exception(
        &exception("RecordNotFound", "no such order"),
        HandleOptions::new(),
    );

    assert!(outcome.notified());
}

#[test]
fn payload_carries_request_summary() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            payload.host() == Some("10.1.2.3")
                && payload.protocol() == Some("HTTP/1.1")
                && payload.uri() == Some("/checkout?step=2")
                && payload.exception_type() == Some("RuntimeError")
                && payload.subject() == r#"[shop ERROR] RuntimeError: "boom""#
                && payload.request().is_some()
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport)
        .build();
    let request = http::Request::get("http://shop.example.com/checkout?step=2")
        .header("X-Forwarded-Host", "proxy.example.com")
        .header("X-Real-IP", "10.1.2.3")
        .body(())
        .unwrap();

    handler.handle_exception(
        &exception("RuntimeError", "boom"),
        HandleOptions::new().request(RequestContext::from_http(&request, Locality::Public)),
    );
}

#[test]
fn async_payloads_never_carry_the_raw_request() {
    let mut queue = MockQueue::new();
    queue
        .expect_enqueue()
        .withf(|notification| {
            let json = notification.to_json().unwrap();
            !json.contains("rack.session")
                && json.contains("HTTP_HOST")
                && notification.clone().into_payload().request().is_none()
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().async_for_controller_errors(true).build())
        .transport(transport_expecting(0))
        .queue(queue)
        .build();
    let request = RequestContext::new(Locality::Public)
        .with_env("HTTP_HOST", "shop.example.com")
        .with_env("rack.session", "session-cookie");

    let outcome = handler.handle_exception(
        &exception("RuntimeError", "boom"),
        HandleOptions::new().request(request).controller(true),
    );

    assert_eq!(
        outcome.notification,
        NotificationStatus::Delivered(DeliveryMode::Async)
    );
}

#[test]
fn async_toggle_off_delivers_synchronously() {
    let mut queue = MockQueue::new();
    queue.expect_enqueue().times(0);
    let handler = ExceptionHandler::builder(config().async_for_non_controller_errors(false).build())
        .transport(transport_expecting(1))
        .queue(queue)
        .build();

    let outcome = handler.handle_exception(&exception("RuntimeError", "boom"), HandleOptions::new());

    assert_eq!(
        outcome.notification,
        NotificationStatus::Delivered(DeliveryMode::Sync)
    );
}

#[test]
#[traced_test]
fn transient_failure_is_requeued_once() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .times(1)
        .returning(|_| Err(TransportError::Transient("421 try again later".to_string())));
    let mut queue = MockQueue::new();
    queue.expect_enqueue().times(1).returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().async_for_non_controller_errors(false).build())
        .transport(transport)
        .queue(queue)
        .build();

    let outcome = handler.handle_exception(&exception("RuntimeError", "boom"), HandleOptions::new());

    assert_eq!(outcome.notification, NotificationStatus::Requeued);
    assert!(logs_contain("attempting to send via the queue"));
}

#[test]
#[traced_test]
fn permanent_failure_is_logged_and_swallowed() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .times(1)
        .returning(|_| Err(TransportError::Failed("550 mailbox unavailable".to_string())));
    let mut queue = MockQueue::new();
    queue.expect_enqueue().times(0);
    let handler = ExceptionHandler::builder(config().async_for_non_controller_errors(false).build())
        .transport(transport)
        .queue(queue)
        .build();

    let outcome = handler.handle_exception(
        &exception("RuntimeError", "ledger write rejected"),
        HandleOptions::new(),
    );

    assert_eq!(outcome.notification, NotificationStatus::Failed);
    logs_assert(|lines| {
        failsafe_block_mentions(lines, "ledger write rejected", "550 mailbox unavailable")
    });
}

#[test]
#[traced_test]
fn rejected_enqueue_is_logged_and_swallowed() {
    let mut queue = MockQueue::new();
    queue
        .expect_enqueue()
        .times(1)
        .returning(|_| Err(TransportError::Failed("queue is full".to_string())));
    let handler = ExceptionHandler::builder(config().async_for_controller_errors(true).build())
        .transport(transport_expecting(0))
        .queue(queue)
        .build();

    let outcome = handler.handle_exception(
        &exception("RuntimeError", "cart total mismatch"),
        HandleOptions::new()
            .request(RequestContext::new(Locality::Public))
            .controller(true),
    );

    assert_eq!(outcome.notification, NotificationStatus::Failed);
    logs_assert(|lines| failsafe_block_mentions(lines, "cart total mismatch", "queue is full"));
}

#[test]
#[traced_test]
fn failed_requeue_is_logged_and_swallowed() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .times(1)
        .returning(|_| Err(TransportError::Transient("421 try again later".to_string())));
    let mut queue = MockQueue::new();
    queue
        .expect_enqueue()
        .times(1)
        .returning(|_| Err(TransportError::Failed("queue backend down".to_string())));
    let handler = ExceptionHandler::builder(config().async_for_non_controller_errors(false).build())
        .transport(transport)
        .queue(queue)
        .build();

    let outcome = handler.handle_exception(
        &exception("RuntimeError", "stock sync lost"),
        HandleOptions::new(),
    );

    assert_eq!(outcome.notification, NotificationStatus::Failed);
    assert!(logs_contain("attempting to send via the queue"));
    logs_assert(|lines| failsafe_block_mentions(lines, "stock sync lost", "queue backend down"));
}

#[test]
fn transient_failure_without_queue_fails() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .times(1)
        .returning(|_| Err(TransportError::Transient("421 try again later".to_string())));
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport)
        .build();

    let outcome = handler.handle_exception(&exception("RuntimeError", "boom"), HandleOptions::new());

    assert_eq!(outcome.notification, NotificationStatus::Failed);
}

#[test]
#[traced_test]
fn supplementary_info_is_logged_and_sent() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            payload.extra_messages() == ["retrying", "Supplementary info:", "user 42"]
                && payload.supplementary_info() == ["user 42"]
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport)
        .supplementary_info(|request| {
            assert!(request.is_none());
            vec!["user 42".to_string()]
        })
        .build();

    handler.handle_exception(
        &exception("RuntimeError", "boom"),
        HandleOptions::new().error_message("retrying"),
    );

    assert!(logs_contain("Supplementary info:"));
    assert!(logs_contain("An exception was caught (RuntimeError):"));
}

#[test]
fn handle_error_uses_first_message() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            payload.exception_type().is_none()
                && payload.message() == "disk almost full"
                && payload.extra_messages() == ["93% used"]
                && payload.proc_name() == "janitor"
                && payload.backtrace() == ["janitor.rs:7"]
                && payload.status_code().is_none()
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().notify_status_codes(Vec::new()).build())
        .transport(transport)
        .build();

    let outcome = handler.handle_error(
        ["disk almost full", "93% used"],
        HandleOptions::new()
            .proc_name("janitor")
            .backtrace(vec!["janitor.rs:7".to_string()]),
    );

    assert_eq!(outcome.status_code, None);
    assert!(outcome.notified());
}

#[test]
fn handle_error_without_messages_keeps_supplementary_header() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            payload.message().is_empty()
                && payload.extra_messages() == ["Supplementary info:", "release 42"]
                && payload.subject() == r#"[shop ERROR] """#
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport)
        .supplementary_info(|_| vec!["release 42".to_string()])
        .build();

    let outcome = handler.handle_error(Vec::<String>::new(), HandleOptions::new());

    assert!(outcome.notified());
}

#[test]
fn parameter_filter_masks_notification_params() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            let params = &payload.request_data().unwrap().params;
            params["card_number"] == "[FILTERED]" && params["item"] == "7"
        })
        .times(1)
        .returning(|_| Ok(()));
    let handler = ExceptionHandler::builder(config().build())
        .transport(transport)
        .parameter_filter(FilterKeys::new(["card"]))
        .build();
    let request = RequestContext::new(Locality::Public)
        .with_query_param("item", "7")
        .with_form_body(b"card_number=4242424242424242");

    handler.handle_exception(
        &exception("RuntimeError", "boom"),
        HandleOptions::new().request(request),
    );
}

#[derive(Debug, thiserror::Error)]
#[error("inventory service unreachable")]
struct InventoryError;

#[test]
fn notify_on_error_handles_failures() {
    let mut transport = MockTransport::new();
    transport
        .expect_deliver()
        .withf(|payload| {
            payload.proc_name() == "inventory-sync"
                && payload.message() == "inventory service unreachable"
                && payload.extra_messages() == ["nightly sync"]
                && payload
                    .exception_type()
                    .is_some_and(|name| name.ends_with("InventoryError"))
        })
        .times(1)
        .returning(|_| Ok(()));
    let mut hierarchy = TypeHierarchy::with_defaults();
    hierarchy
        .register(std::any::type_name::<InventoryError>(), Some("StandardError"))
        .unwrap();
    let handler = ExceptionHandler::builder(
        config()
            .map_status_code(
                std::any::type_name::<InventoryError>(),
                StatusCode::SERVICE_UNAVAILABLE,
            )
            .build(),
    )
    .hierarchy(hierarchy)
    .transport(transport)
    .build();

    let result: Option<()> = handler.notify_on_error(Some("inventory-sync"), Some("nightly sync"), || {
        Err(InventoryError)
    });

    assert_eq!(result, None);
}

#[test]
fn render_errors_picks_a_template() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("404.html"), "not found").unwrap();
    let handler = ExceptionHandler::builder(config().error_template_dir(dir.path()).build())
        .transport(transport_expecting(0))
        .build();

    let outcome = handler.handle_exception(
        &exception("RoutingError", "no route matches"),
        HandleOptions::new()
            .request(RequestContext::new(Locality::Public).with_env("HTTP_ACCEPT", "text/html"))
            .render_errors(true),
    );

    let template = outcome.template.unwrap();
    assert_eq!(template.path, dir.path().join("404.html"));
    assert_eq!(template.source, TemplateSource::StatusCode);
}

#[test]
fn render_errors_falls_back_to_last_resort() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("500.html"), "sorry").unwrap();
    let handler = ExceptionHandler::builder(config().bundled_template_dir(dir.path()).build())
        .transport(transport_expecting(0))
        .build();

    let outcome = handler.handle_exception(
        &exception("RecordNotFound", "no such order"),
        HandleOptions::new()
            .render_errors(true)
            .response_format(ResponseFormat::Js),
    );

    let template = outcome.template.unwrap();
    assert_eq!(template.path, dir.path().join("500.html"));
    assert_eq!(template.source, TemplateSource::LastResort);
}
