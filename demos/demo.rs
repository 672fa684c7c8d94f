use accesslog::{AccessLogConfig, AccessLogLayer, AccessLogRecord, AccessLogSink, LoggingSink, MultiSink};
use axum::{
    body::Body,
    extract::Query,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sink that keeps a summary of every record in memory for the `/stats` endpoint
#[derive(Debug, Clone, Default)]
struct StatsSink {
    captured: Arc<Mutex<Vec<CapturedExchange>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapturedExchange {
    correlation_id: u64,
    method: String,
    path: String,
    status: u16,
    duration_ms: u64,
    response_bytes: u64,
    request_body: Option<String>,
    response_body: Option<String>,
    error: Option<String>,
}

impl StatsSink {
    fn snapshot(&self) -> Vec<CapturedExchange> {
        self.captured.lock().map(|captured| captured.clone()).unwrap_or_default()
    }
}

impl AccessLogSink for StatsSink {
    async fn record(&self, record: AccessLogRecord) {
        let exchange = CapturedExchange {
            correlation_id: record.request.correlation_id,
            method: record.request.method.to_string(),
            path: record.request.path.clone(),
            status: record.status.as_u16(),
            duration_ms: record.duration_millis,
            response_bytes: record.response_bytes,
            request_body: record.request_body.as_ref().map(|body| body.preview()),
            response_body: record.response_body.as_ref().map(|body| body.preview()),
            error: record.error.as_ref().map(ToString::to_string),
        };
        if let Ok(mut captured) = self.captured.lock() {
            captured.push(exchange);
        }
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    time: u64,
}

// Handlers for the demo server
async fn hello_handler() -> impl IntoResponse {
    "Hello, World!"
}

async fn sleep_handler(Query(params): Query<SleepParams>) -> impl IntoResponse {
    sleep(Duration::from_millis(params.time)).await;
    params.time.to_string()
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;
    use tokio::time::interval;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            let mut interval = interval(Duration::from_millis(200));
            interval.tick().await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}

async fn download_handler() -> impl IntoResponse {
    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    ([(header::CONTENT_TYPE, "application/octet-stream")], payload)
}

async fn stats_handler(stats: StatsSink) -> impl IntoResponse {
    let data = stats.snapshot();
    axum::Json(serde_json::json!({
        "total_requests": data.len(),
        "failed_requests": data.iter().filter(|exchange| exchange.error.is_some()).count(),
        "requests": data
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,accesslog=debug")),
        )
        .init();

    info!("Starting access log demo server");

    let stats = StatsSink::default();
    let stats_for_route = stats.clone();

    let config = AccessLogConfig {
        request_body_length: 256,
        response_body_length: 1024,
        include_response: true,
        ..Default::default()
    };
    let sink = MultiSink::new().with(LoggingSink).with(stats);

    let app = Router::new()
        .route("/hello", get(hello_handler))
        .route("/sleep", get(sleep_handler))
        .route("/echo", post(echo_handler))
        .route("/streaming", get(streaming_handler))
        .route("/download", get(download_handler))
        .route("/stats", get(move || stats_handler(stats_for_route.clone())))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(AccessLogLayer::new(config, sink))
                .into_inner(),
        );

    info!("Demo server endpoints:");
    info!("  GET  /hello           - Simple greeting");
    info!("  GET  /sleep?time=500  - Delayed response");
    info!("  POST /echo            - Echo request body");
    info!("  GET  /streaming       - Streaming response");
    info!("  GET  /download        - Binary download (counted, not captured)");
    info!("  GET  /stats           - Summaries of recorded exchanges");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Demo server listening on http://localhost:3000");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
