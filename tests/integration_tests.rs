use accesslog::{AccessLogConfig, AccessLogLayer, AccessLogRecord, AccessLogSink, RequestFailure};
use axum::{
    body::Body,
    extract::{Query, RawQuery},
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tower::{ServiceBuilder, ServiceExt};

/// Test sink that collects every emitted record for verification
#[derive(Debug, Clone, Default)]
struct CollectingSink {
    records: Arc<Mutex<Vec<AccessLogRecord>>>,
}

impl CollectingSink {
    fn records(&self) -> Vec<AccessLogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Wait until `expected` records arrived, then a little longer to catch duplicates.
    async fn wait_for_records(&self, expected: usize, timeout: Duration) -> Vec<AccessLogRecord> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.records.lock().unwrap().len() >= expected {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;
        self.records()
    }

    async fn single_record(&self) -> AccessLogRecord {
        let records = self.wait_for_records(1, Duration::from_secs(2)).await;
        assert_eq!(records.len(), 1, "expected exactly one access log record");
        records.into_iter().next().unwrap()
    }
}

impl AccessLogSink for CollectingSink {
    async fn record(&self, record: AccessLogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    time: u64,
}

#[derive(Debug, Deserialize)]
struct PayloadParams {
    times: usize,
}

fn octet_payload() -> Vec<u8> {
    (0..4096u32).map(|i| (i % 251) as u8).collect()
}

// Test server handlers
async fn plain_handler() -> impl IntoResponse {
    "OK"
}

async fn sleep_handler(Query(params): Query<SleepParams>) -> impl IntoResponse {
    sleep(Duration::from_millis(params.time)).await;
    params.time.to_string()
}

async fn demo_handler(RawQuery(query): RawQuery) -> impl IntoResponse {
    query.unwrap_or_default()
}

async fn octet_stream_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        octet_payload(),
    )
}

async fn max_payload_handler(Query(params): Query<PayloadParams>) -> impl IntoResponse {
    let address: Vec<String> = (0..params.times).map(|i| format!("a{i}")).collect();
    Json(serde_json::json!({ "name": "thomas", "age": "29", "address": address }))
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn ignore_body_handler() -> impl IntoResponse {
    "ignored"
}

async fn streaming_handler() -> impl IntoResponse {
    let stream = stream::iter(vec![
        Ok::<_, std::convert::Infallible>(Bytes::from("chunk1")),
        Ok(Bytes::from("chunk2")),
        Ok(Bytes::from("chunk3")),
    ]);

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn broken_stream_handler() -> impl IntoResponse {
    let stream = stream::iter(vec![
        Ok(Bytes::from("partial")),
        Err(std::io::Error::other("handler exploded mid-write")),
    ]);

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn panic_handler() -> &'static str {
    panic!("handler panicked on purpose")
}

async fn large_handler() -> impl IntoResponse {
    "x".repeat(2048)
}

fn create_test_app(sink: CollectingSink, config: AccessLogConfig) -> Router {
    Router::new()
        .route("/get/test1", get(plain_handler))
        .route("/actuator/info", get(plain_handler))
        .route("/get/sleep", get(sleep_handler))
        .route("/get/demo", get(demo_handler))
        .route("/get/octetStream", get(octet_stream_handler))
        .route("/get/maxPayload", get(max_payload_handler))
        .route("/echo", post(echo_handler))
        .route("/ignore", post(ignore_body_handler))
        .route("/streaming", get(streaming_handler))
        .route("/broken", get(broken_stream_handler))
        .route("/panic", get(panic_handler))
        .route("/large", get(large_handler))
        .layer(
            ServiceBuilder::new()
                .layer(AccessLogLayer::new(config, sink))
                .into_inner(),
        )
}

fn request_only_config() -> AccessLogConfig {
    AccessLogConfig {
        response_body_length: 1024,
        ..Default::default()
    }
}

fn both_config() -> AccessLogConfig {
    AccessLogConfig {
        response_body_length: 1024,
        include_response: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_plain_request_without_response_details() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), request_only_config())).unwrap();

    let response = server
        .get("/get/test1")
        .add_header(
            HeaderName::from_static("header-key"),
            HeaderValue::from_static("header-value"),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "OK");

    let record = sink.single_record().await;
    assert_eq!(record.request.method, Method::GET);
    assert_eq!(record.request.path, "/get/test1");
    assert_eq!(record.request.headers["header-key"], vec!["header-value"]);
    assert_eq!(record.status, StatusCode::OK);
    assert_eq!(record.response_bytes, 2);
    assert!(record.response_body.is_none());
    assert!(record.response_headers.is_none());
    assert!(record.request_body.is_none());
    assert!(record.error.is_none());
}

#[tokio::test]
async fn test_plain_request_with_response_details() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server.get("/actuator/info").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let record = sink.single_record().await;
    assert_eq!(record.request.path, "/actuator/info");
    let body = record.response_body.expect("response body should be captured");
    assert_eq!(body.bytes, "OK");
    assert!(!body.truncated());
    let headers = record.response_headers.expect("response headers should be captured");
    assert!(headers["content-type"][0].starts_with("text/plain"));
}

#[tokio::test]
async fn test_sleep_duration_is_measured() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server.get("/get/sleep?time=1000").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "1000");

    let record = sink.single_record().await;
    assert!(record.duration_millis >= 1000);
    assert!(record.time_to_headers_millis.unwrap() >= 1000);
    assert!(record.duration() >= Duration::from_secs(1));
    assert_eq!(record.request.query_params["time"], vec!["1000"]);
}

#[tokio::test]
async fn test_octet_stream_passes_through_untouched() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server.get("/get/octetStream").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(&response.as_bytes()[..], &octet_payload()[..]);

    let record = sink.single_record().await;
    assert_eq!(record.response_bytes, 4096);
    let body = record.response_body.expect("response body summary should be present");
    assert!(body.bytes.is_empty(), "binary content must not be captured");
    assert_eq!(body.total_bytes, 4096);
}

#[tokio::test]
async fn test_repeated_query_parameters_keep_order() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server
        .get("/get/demo?name=thomas&age=29&address=a1&address=a2")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "name=thomas&age=29&address=a1&address=a2");

    let record = sink.single_record().await;
    let params = &record.request.query_params;
    assert_eq!(params["name"], vec!["thomas"]);
    assert_eq!(params["age"], vec!["29"]);
    assert_eq!(params["address"], vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_malformed_query_does_not_fail_request() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server.get("/get/demo?good=1&bad=%zz").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let record = sink.single_record().await;
    assert_eq!(record.request.query_params["good"], vec!["1"]);
    assert!(record.request.query_params["bad"].is_empty());
}

#[tokio::test]
async fn test_large_json_payload_is_truncated() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    let response = server.get("/get/maxPayload?times=200").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: serde_json::Value = response.json();
    assert_eq!(json["name"], "thomas");
    assert_eq!(json["address"].as_array().unwrap().len(), 200);
    let sent = response.as_bytes().len() as u64;

    let record = sink.single_record().await;
    let body = record.response_body.unwrap();
    assert_eq!(body.bytes.len(), 1024);
    assert_eq!(body.total_bytes, sent);
    assert!(body.truncated());
    assert_eq!(&body.bytes[..], &response.as_bytes()[..1024]);
}

#[tokio::test]
async fn test_streaming_response_is_forwarded_and_captured() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        response_body_length: 8,
        include_response: true,
        ..Default::default()
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/streaming").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "chunk1chunk2chunk3");

    let record = sink.single_record().await;
    let body = record.response_body.unwrap();
    assert_eq!(body.bytes, "chunk1ch");
    assert_eq!(body.total_bytes, 18);
    assert_eq!(record.response_bytes, 18);
}

#[tokio::test]
async fn test_request_body_capture() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        request_body_length: 1024,
        ..both_config()
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.post("/echo").text("Hello, World!").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Echo: Hello, World!");

    let record = sink.single_record().await;
    assert_eq!(record.request.method, Method::POST);
    let request_body = record.request_body.unwrap();
    assert_eq!(request_body.bytes, "Hello, World!");
    assert_eq!(request_body.total_bytes, 13);
    assert_eq!(record.response_body.unwrap().bytes, "Echo: Hello, World!");
}

#[tokio::test]
async fn test_request_body_captured_when_handler_ignores_it() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        request_body_length: 8,
        ..Default::default()
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.post("/ignore").text("hello world!!").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "ignored");

    let record = sink.single_record().await;
    let request_body = record.request_body.unwrap();
    assert_eq!(request_body.bytes, "hello wo");
    assert!(request_body.truncated());
}

#[tokio::test]
async fn test_empty_request_body_with_capture_enabled() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        request_body_length: 64,
        ..Default::default()
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    let response = server.get("/get/test1").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let record = sink.single_record().await;
    let request_body = record.request_body.unwrap();
    assert!(request_body.bytes.is_empty());
    assert_eq!(request_body.total_bytes, 0);
}

#[tokio::test]
async fn test_sensitive_headers_are_redacted() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    server
        .get("/get/test1")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"))
        .await;

    let record = sink.single_record().await;
    assert_eq!(record.request.headers["authorization"], vec!["[REDACTED]"]);
}

#[tokio::test]
async fn test_forwarded_address_when_trusted() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        trust_forwarded_headers: true,
        ..Default::default()
    };
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap();

    server
        .get("/get/test1")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        )
        .await;

    let record = sink.single_record().await;
    assert_eq!(record.request.remote_address.as_deref(), Some("203.0.113.7"));
}

#[tokio::test]
async fn test_body_error_mid_write_is_recorded() {
    let sink = CollectingSink::default();
    let app = create_test_app(sink.clone(), both_config());

    let response = app
        .oneshot(Request::get("/broken").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert_eq!(first.into_data().unwrap(), "partial");
    assert!(body.frame().await.unwrap().is_err());

    let record = sink.single_record().await;
    assert_eq!(record.status, StatusCode::OK);
    assert_eq!(record.response_bytes, 7);
    assert_eq!(record.response_body.unwrap().bytes, "partial");
    match record.error {
        Some(RequestFailure::Body(message)) => assert!(message.contains("handler exploded")),
        other => panic!("expected a body failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_abort_emits_partial_record() {
    let sink = CollectingSink::default();
    let app = create_test_app(sink.clone(), both_config());

    let response = app
        .oneshot(Request::get("/streaming").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    body.frame().await.unwrap().unwrap();
    drop(body);

    let record = sink.single_record().await;
    assert_eq!(record.error, Some(RequestFailure::Aborted { bytes_sent: 6 }));
    assert_eq!(record.response_bytes, 6);
}

#[tokio::test]
async fn test_handler_panic_is_recorded_and_propagated() {
    let sink = CollectingSink::default();
    let app = create_test_app(sink.clone(), both_config());

    let handle = tokio::spawn(app.oneshot(Request::get("/panic").body(Body::empty()).unwrap()));
    let join_error = handle.await.unwrap_err();
    assert!(join_error.is_panic());

    let record = sink.single_record().await;
    assert_eq!(record.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        record.error,
        Some(RequestFailure::Panicked("handler panicked on purpose".to_string()))
    );
}

#[tokio::test]
async fn test_head_request_is_logged_as_success() {
    let sink = CollectingSink::default();
    let app = create_test_app(sink.clone(), both_config());

    let response = app
        .oneshot(Request::head("/get/test1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    let record = sink.single_record().await;
    assert_eq!(record.request.method, Method::HEAD);
    assert_eq!(record.status, StatusCode::OK);
    assert!(record.error.is_none(), "unexpected failure: {:?}", record.error);
}

#[tokio::test]
async fn test_panic_before_returning_future_is_recorded() {
    let sink = CollectingSink::default();
    let service = ServiceBuilder::new()
        .layer(AccessLogLayer::new(both_config(), sink.clone()))
        .service(tower::service_fn(
            |_request: Request<Body>| -> std::future::Ready<Result<Response, std::io::Error>> {
                panic!("panicked before returning a future")
            },
        ));

    let handle = tokio::spawn(service.oneshot(Request::get("/get/test1").body(Body::empty()).unwrap()));
    assert!(handle.await.unwrap_err().is_panic());

    let record = sink.single_record().await;
    assert_eq!(record.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        record.error,
        Some(RequestFailure::Panicked("panicked before returning a future".to_string()))
    );
}

#[tokio::test]
async fn test_inner_service_error_is_recorded_and_returned() {
    let sink = CollectingSink::default();
    let service = ServiceBuilder::new()
        .layer(AccessLogLayer::new(both_config(), sink.clone()))
        .service(tower::service_fn(|_request: Request<Body>| async {
            Err::<Response, _>(std::io::Error::other("backend unavailable"))
        }));

    let result = service
        .oneshot(Request::get("/get/test1").body(Body::empty()).unwrap())
        .await;
    assert_eq!(result.unwrap_err().to_string(), "backend unavailable");

    let record = sink.single_record().await;
    assert_eq!(record.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        record.error,
        Some(RequestFailure::Handler("backend unavailable".to_string()))
    );
    assert!(record.response_body.is_none());
}

#[tokio::test]
async fn test_cancelled_request_still_emits_record() {
    let sink = CollectingSink::default();
    let app = create_test_app(sink.clone(), both_config());

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        app.oneshot(
            Request::get("/get/sleep?time=5000")
                .body(Body::empty())
                .unwrap(),
        ),
    )
    .await;
    assert!(result.is_err(), "request should have timed out");

    let record = sink.single_record().await;
    assert_eq!(record.error, Some(RequestFailure::Cancelled));
    assert_eq!(record.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(record.duration_millis >= 50);
}

#[tokio::test]
async fn test_multiple_concurrent_requests() {
    let sink = CollectingSink::default();
    let config = AccessLogConfig {
        request_body_length: 1024,
        ..both_config()
    };
    let server = Arc::new(axum_test::TestServer::new(create_test_app(sink.clone(), config)).unwrap());

    let futures: Vec<_> = (0..5)
        .map(|i| {
            let server = server.clone();
            async move { server.post("/echo").text(format!("Request {i}")).await }
        })
        .collect();
    let responses = futures::future::join_all(futures).await;

    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), format!("Echo: Request {i}"));
    }

    let records = sink.wait_for_records(5, Duration::from_secs(2)).await;
    assert_eq!(records.len(), 5);

    let mut correlation_ids = HashSet::new();
    for record in &records {
        assert!(correlation_ids.insert(record.request.correlation_id));
        let request_body = record.request_body.as_ref().unwrap().preview();
        let response_body = record.response_body.as_ref().unwrap().preview();
        assert_eq!(response_body, format!("Echo: {request_body}"));
    }
}

#[tokio::test]
async fn test_record_serializes_to_json() {
    let sink = CollectingSink::default();
    let server = axum_test::TestServer::new(create_test_app(sink.clone(), both_config())).unwrap();

    server.get("/large").await;

    let record = sink.single_record().await;
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["method"], "GET");
    assert_eq!(json["path"], "/large");
    assert_eq!(json["status"], 200);
    assert_eq!(json["response_bytes"], 2048);
    assert_eq!(json["response_body"]["truncated"], true);
    assert_eq!(json["response_body"]["preview"].as_str().unwrap().len(), 1024);
    assert!(json.get("error").is_none());
    assert!(json.get("started").is_none());
}
