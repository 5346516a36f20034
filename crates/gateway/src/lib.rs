//! Offramp gateway
//!
//! Thin HTTP surface over the dispatch core. Maps a non-streaming handle
//! to a single JSON response, a streaming text handle to Server-Sent-Event
//! lines, and a streaming binary handle to raw chunk writes. No dispatch
//! logic lives here; the core guarantees ordered, exactly-once chunk
//! delivery and this layer only frames it.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use offramp_common::{metrics::METRICS, OfframpConfig, OfframpError, Result};
use offramp_core::{Chunk, InferHandle, StreamConsumer, Supervisor};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    supervisor: Arc<Supervisor>,
    request_timeout: Option<Duration>,
}

impl AppState {
    /// Create gateway state over a running worker pool
    pub fn new(supervisor: Arc<Supervisor>, config: &OfframpConfig) -> Self {
        Self {
            supervisor,
            request_timeout: config.request_timeout(),
        }
    }
}

/// Request body accepted by the infer endpoint
#[derive(Debug, Deserialize)]
pub struct InferBody {
    /// Positional arguments for the callable
    #[serde(default)]
    pub args: Vec<Value>,

    /// Named arguments for the callable
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// Request an ordered chunk stream instead of a single value
    #[serde(default)]
    pub stream: bool,

    /// Media type of a streamed response; non-text types are framed as
    /// raw bytes instead of SSE lines
    #[serde(default)]
    pub media_type: Option<String>,

    /// Regroup binary output into buffers of roughly this many bytes
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// Build the gateway router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/infer", post(infer_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the gateway until the process is told to stop
pub async fn serve(state: AppState, config: &OfframpConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| OfframpError::config(format!("Invalid bind address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let live = state.supervisor.live_worker_count();
    Json(serde_json::json!({
        "status": if live > 0 { "ok" } else { "degraded" },
        "live_workers": live,
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
}

async fn infer_handler(State(state): State<AppState>, Json(body): Json<InferBody>) -> Response {
    let dispatcher = state.supervisor.dispatcher();

    let handle = match dispatcher.submit(body.args, body.kwargs, body.stream) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };

    match handle {
        InferHandle::Single(waiter) => {
            let result = match state.request_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, waiter.await_result()).await
                {
                    Ok(result) => result,
                    Err(_) => Err(OfframpError::timeout("request deadline exceeded")),
                },
                None => waiter.await_result().await,
            };

            match result {
                Ok(value) => Json(value).into_response(),
                Err(err) => error_response(err),
            }
        }
        InferHandle::Stream(consumer) => {
            if is_binary(body.media_type.as_deref()) {
                let media_type = body
                    .media_type
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                binary_response(consumer, media_type, body.chunk_size)
            } else {
                sse_response(consumer)
            }
        }
    }
}

/// Streamed responses default to SSE text framing; an explicit non-text
/// media type selects raw byte framing
fn is_binary(media_type: Option<&str>) -> bool {
    matches!(media_type, Some(mt) if !mt.starts_with("text/"))
}

fn error_response(err: OfframpError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Adapt the pull-based consumer into an ordered chunk stream
fn chunk_stream(consumer: StreamConsumer) -> impl Stream<Item = Result<Chunk>> {
    stream::unfold(consumer, |mut consumer| async move {
        consumer.next().await.map(|item| (item, consumer))
    })
}

/// Frame text chunks as Server-Sent-Event lines
fn sse_response(consumer: StreamConsumer) -> Response {
    let events = chunk_stream(consumer).filter_map(|item| async move {
        match item {
            // The terminal marker closes the event stream.
            Ok(chunk) if chunk.last => None,
            Ok(chunk) => Some(Ok::<_, Infallible>(
                Event::default().data(chunk.payload.into_text()),
            )),
            Err(err) => Some(Ok(Event::default().event("error").data(err.to_string()))),
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// Frame binary chunks as raw chunked writes
fn binary_response(
    consumer: StreamConsumer,
    media_type: String,
    chunk_size: Option<usize>,
) -> Response {
    let bytes = chunk_stream(consumer).filter_map(|item| async move {
        match item {
            Ok(chunk) if chunk.last => None,
            Ok(chunk) => Some(Ok(Bytes::from(chunk.payload.into_bytes()))),
            Err(err) => Some(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))),
        }
    });

    let body = match chunk_size {
        Some(size) if size > 0 => Body::from_stream(rechunk(Box::pin(bytes), size)),
        _ => Body::from_stream(bytes),
    };

    ([(header::CONTENT_TYPE, media_type)], body).into_response()
}

/// Regroup a byte stream into buffers of `size` bytes (last one short)
fn rechunk<S>(upstream: S, size: usize) -> impl Stream<Item = std::io::Result<Bytes>>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    struct RechunkState<S> {
        upstream: S,
        buf: BytesMut,
        done: bool,
    }

    stream::unfold(
        RechunkState {
            upstream,
            buf: BytesMut::new(),
            done: false,
        },
        move |mut state| async move {
            loop {
                if state.buf.len() >= size {
                    let out = state.buf.split_to(size).freeze();
                    return Some((Ok(out), state));
                }
                if state.done {
                    if state.buf.is_empty() {
                        return None;
                    }
                    let out = state.buf.split().freeze();
                    return Some((Ok(out), state));
                }
                match state.upstream.next().await {
                    Some(Ok(bytes)) => state.buf.extend_from_slice(&bytes),
                    Some(Err(err)) => {
                        state.done = true;
                        state.buf.clear();
                        return Some((Err(err), state));
                    }
                    None => state.done = true,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http_body_util::BodyExt;
    use offramp_core::{CallOutcome, Callable, ChunkPayload};
    use serde_json::json;
    use tower::ServiceExt;

    struct Greeter;

    impl Callable for Greeter {
        fn invoke(
            &mut self,
            args: &[Value],
            _kwargs: &Map<String, Value>,
        ) -> Result<CallOutcome> {
            let name = args.first().and_then(|v| v.as_str()).unwrap_or("world");
            Ok(CallOutcome::Value(
                json!({ "message": format!("Hello, {}!", name) }),
            ))
        }
    }

    struct Tokens;

    impl Callable for Tokens {
        fn invoke(
            &mut self,
            _args: &[Value],
            _kwargs: &Map<String, Value>,
        ) -> Result<CallOutcome> {
            Ok(CallOutcome::Stream(Box::new(
                ["tok0 ", "tok1 "]
                    .into_iter()
                    .map(|t| Ok(ChunkPayload::Text(t.to_string()))),
            )))
        }
    }

    fn test_state(callables: Vec<Box<dyn Callable>>) -> AppState {
        let config = OfframpConfig::from_env().unwrap();
        let supervisor = Arc::new(Supervisor::start(callables, &config.dispatch).unwrap());
        AppState::new(supervisor, &config)
    }

    #[test]
    fn test_infer_body_defaults() {
        let body: InferBody = serde_json::from_str(r#"{"args": ["Hello"]}"#).unwrap();

        assert_eq!(body.args, vec![json!("Hello")]);
        assert!(body.kwargs.is_empty());
        assert!(!body.stream);
        assert_eq!(body.media_type, None);
        assert_eq!(body.chunk_size, None);
    }

    #[test]
    fn test_binary_framing_selection() {
        assert!(!is_binary(None));
        assert!(!is_binary(Some("text/plain")));
        assert!(is_binary(Some("audio/wav")));
        assert!(is_binary(Some("application/octet-stream")));
    }

    #[tokio::test]
    async fn test_infer_endpoint_returns_json_value() {
        let app = create_router(test_state(vec![Box::new(Greeter)]));

        let response = app
            .oneshot(
                axum::http::Request::post("/api/v1/infer")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"args": ["X"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"message": "Hello, X!"}));
    }

    #[tokio::test]
    async fn test_infer_endpoint_streams_sse_lines() {
        let app = create_router(test_state(vec![Box::new(Tokens)]));

        let response = app
            .oneshot(
                axum::http::Request::post("/api/v1/infer")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"stream": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let first = text.find("data: tok0").unwrap();
        let second = text.find("data: tok1").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_live_workers() {
        let app = create_router(test_state(vec![Box::new(Greeter)]));

        let response = app
            .oneshot(
                axum::http::Request::get("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], json!("ok"));
        assert_eq!(value["live_workers"], json!(1));
    }

    #[tokio::test]
    async fn test_rechunk_regroups_byte_stream() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
            Ok(Bytes::from_static(b"h")),
        ]);

        let chunks: Vec<Bytes> = rechunk(Box::pin(upstream), 4)
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
    }

    #[tokio::test]
    async fn test_error_response_carries_mapped_status() {
        let response = error_response(OfframpError::overloaded("all queues full"));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["error"].as_str().unwrap().contains("overloaded"));
    }
}
