//! HTTP server implementing the durable streams protocol.
//!
//! A thin axum layer over [`StreamStore`]: PUT creates, POST appends (or
//! closes), GET reads in catch-up, long-poll or SSE mode, HEAD exposes
//! metadata, DELETE removes. All storage semantics live in the engine;
//! this module only translates headers, bodies and status codes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{delete, get, head, post, put},
    Router,
};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cursor::{parse_cursor, CursorOptions},
    error::StoreError,
    store::StreamStore,
    types::{
        is_json_content_type, normalize_content_type, AppendOptions, Offset, ProducerOutcome,
        ServerOptions, StreamConfig, StreamMessage,
    },
};

const HEADER_STREAM_NEXT_OFFSET: &str = "Stream-Next-Offset";
const HEADER_STREAM_UP_TO_DATE: &str = "Stream-Up-To-Date";
const HEADER_STREAM_CURSOR: &str = "Stream-Cursor";
const HEADER_STREAM_SEQ: &str = "Stream-Seq";
const HEADER_STREAM_TTL: &str = "Stream-TTL";
const HEADER_STREAM_EXPIRES_AT: &str = "Stream-Expires-At";
const HEADER_STREAM_CLOSED: &str = "Stream-Closed";
const HEADER_PRODUCER_ID: &str = "Producer-Id";
const HEADER_PRODUCER_EPOCH: &str = "Producer-Epoch";
const HEADER_PRODUCER_SEQ: &str = "Producer-Seq";
const HEADER_PRODUCER_EXPECTED_SEQ: &str = "Producer-Expected-Seq";
const HEADER_PRODUCER_RECEIVED_SEQ: &str = "Producer-Received-Seq";
const HEADER_SSE_DATA_ENCODING: &str = "Stream-SSE-Data-Encoding";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StreamStore>,
    pub options: ServerOptions,
}

impl AppState {
    fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            interval_seconds: self.options.cursor_interval_seconds,
            epoch: self.options.cursor_epoch,
        }
    }
}

/// Query parameters for GET requests.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
}

/// Create the router with all stream endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
        .expose_headers(tower_http::cors::Any);

    Router::new()
        .route("/{*path}", put(handle_create))
        .route("/{*path}", head(handle_head))
        .route("/{*path}", get(handle_read))
        .route("/{*path}", post(handle_append))
        .route("/{*path}", delete(handle_delete))
        .layer(cors)
        .with_state(state)
}

/// PUT - create a stream (idempotent).
async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{path}");

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from);
    let ttl_seconds = match parse_ttl_header(&headers) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let expires_at = match parse_expires_at_header(&headers) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let closed = header_is_true(&headers, HEADER_STREAM_CLOSED);

    let body_bytes: Bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };
    let initial_data = if body_bytes.is_empty() {
        None
    } else {
        Some(body_bytes.to_vec())
    };

    let config = StreamConfig {
        content_type,
        ttl_seconds,
        expires_at,
        initial_data,
        closed,
    };

    match state.store.create(&path, config) {
        Ok((metadata, created)) => {
            let mut response = Response::builder()
                .status(if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                })
                .header(HEADER_STREAM_NEXT_OFFSET, metadata.current_offset.to_string())
                .header(header::CONTENT_TYPE, metadata.content_type);
            if metadata.closed {
                response = response.header(HEADER_STREAM_CLOSED, "true");
            }
            response.body(Body::empty()).unwrap()
        }
        Err(e) => error_response(e),
    }
}

/// HEAD - stream metadata.
async fn handle_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let path = format!("/{path}");
    let metadata = match state.store.get(&path) {
        Ok(m) => m,
        Err(e) => return error_response(e),
    };

    let start_offset = query.offset.as_deref().unwrap_or("-1");
    let cursor = state
        .cursor_options()
        .response_cursor(query.cursor.as_deref().and_then(parse_cursor));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, metadata.content_type.as_str())
        .header(HEADER_STREAM_NEXT_OFFSET, metadata.current_offset.to_string())
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(
            header::ETAG,
            generate_etag(&path, start_offset, &metadata.current_offset.to_string()),
        );
    if let Some(ttl) = metadata.ttl_seconds {
        response = response.header(HEADER_STREAM_TTL, ttl.to_string());
    }
    if let Some(expires_at) = metadata.expires_at {
        response = response.header(
            HEADER_STREAM_EXPIRES_AT,
            expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    if metadata.closed {
        response = response.header(HEADER_STREAM_CLOSED, "true");
    }
    response.body(Body::empty()).unwrap()
}

/// GET - read from a stream (catch-up, long-poll, or SSE).
async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    let path = format!("/{path}");

    let offset = match Offset::parse(query.offset.as_deref().unwrap_or("-1")) {
        Ok(offset) => offset,
        Err(e) => return error_response(e),
    };
    let cursor = state
        .cursor_options()
        .response_cursor(query.cursor.as_deref().and_then(parse_cursor));

    match query.live.as_deref() {
        Some("sse") => handle_sse(state, path, offset, cursor),
        Some("long-poll") => handle_long_poll(state, path, offset, cursor).await,
        _ => handle_catch_up(state, path, offset, cursor),
    }
}

/// Immediate read of whatever is committed past `offset`.
fn handle_catch_up(state: AppState, path: String, offset: Offset, cursor: u64) -> Response {
    let metadata = match state.store.get(&path) {
        Ok(m) => m,
        Err(e) => return error_response(e),
    };
    let result = match state.store.read(&path, offset) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };

    read_response(
        &metadata.content_type,
        metadata.closed,
        &path,
        offset,
        result.next_offset,
        result.up_to_date,
        cursor,
        &result.messages,
    )
}

/// Block until data past `offset` arrives or the timeout elapses.
async fn handle_long_poll(state: AppState, path: String, offset: Offset, cursor: u64) -> Response {
    let cancel = CancellationToken::new();
    let deadline = Instant::now() + state.options.long_poll_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = match state
            .store
            .wait_for_messages(&cancel, &path, offset, remaining)
            .await
        {
            Ok(wait) => wait,
            Err(e) => return error_response(e),
        };

        if !wait.messages.is_empty() {
            let metadata = match state.store.get(&path) {
                Ok(m) => m,
                Err(e) => return error_response(e),
            };
            return read_response(
                &metadata.content_type,
                metadata.closed,
                &path,
                offset,
                wait.next_offset,
                true,
                cursor,
                &wait.messages,
            );
        }
        if wait.closed || wait.timed_out || remaining.is_zero() {
            let current = state.store.current_offset(&path).unwrap_or(offset);
            let mut response = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(HEADER_STREAM_NEXT_OFFSET, current.to_string())
                .header(HEADER_STREAM_CURSOR, cursor.to_string())
                .header(HEADER_STREAM_UP_TO_DATE, "true");
            if wait.closed {
                response = response.header(HEADER_STREAM_CLOSED, "true");
            }
            return response.body(Body::empty()).unwrap();
        }
        // Spurious wakeup: keep waiting out the remainder of the deadline.
    }
}

/// Stream `event: data` / `event: control` frames until the client goes
/// away or the stream closes.
fn handle_sse(state: AppState, path: String, offset: Offset, cursor: u64) -> Response {
    let content_type = match state.store.get(&path) {
        Ok(m) => m.content_type,
        Err(e) => return error_response(e),
    };
    // The engine hands out raw bytes; binary payloads ride SSE as base64.
    let base64_encode = !is_textual_content_type(&content_type);

    let stream = sse_event_stream(state, path, offset, cursor, base64_encode);
    let mut response = Sse::new(stream)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response();
    if base64_encode {
        response
            .headers_mut()
            .insert(HEADER_SSE_DATA_ENCODING, "base64".parse().unwrap());
    }
    response
}

fn sse_event_stream(
    state: AppState,
    path: String,
    mut offset: Offset,
    cursor: u64,
    base64_encode: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let cursor_options = state.cursor_options();
    async_stream::stream! {
        let cancel = CancellationToken::new();
        let mut cursor = cursor;
        loop {
            let wait = match state
                .store
                .wait_for_messages(&cancel, &path, offset, state.options.long_poll_timeout)
                .await
            {
                Ok(wait) => wait,
                // Stream deleted or an I/O failure; end the event stream.
                Err(_) => break,
            };

            for message in &wait.messages {
                yield Ok(Event::default().event("data").data(encode_sse_data(
                    &message.data,
                    base64_encode,
                )));
            }
            if !wait.messages.is_empty() {
                offset = wait.next_offset;
            }

            let up_to_date = match state.store.current_offset(&path) {
                Ok(current) => offset >= current,
                Err(_) => break,
            };
            cursor = cursor_options.response_cursor(Some(cursor));
            let control = serde_json::json!({
                "streamNextOffset": offset.to_string(),
                "streamCursor": cursor.to_string(),
                "upToDate": up_to_date,
            });
            yield Ok(Event::default().event("control").data(control.to_string()));

            if wait.closed {
                break;
            }
        }
    }
}

/// POST - append to a stream, or close it when the body is empty and
/// `Stream-Closed: true` is set.
async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{path}");

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from);
    let seq = header_str(&headers, HEADER_STREAM_SEQ).map(String::from);
    let close = header_is_true(&headers, HEADER_STREAM_CLOSED);
    let producer_id = header_str(&headers, HEADER_PRODUCER_ID).map(String::from);
    let producer_epoch = match parse_i64_header(&headers, HEADER_PRODUCER_EPOCH) {
        Ok(v) => v,
        Err(response) => return response,
    };
    let producer_seq = match parse_i64_header(&headers, HEADER_PRODUCER_SEQ) {
        Ok(v) => v,
        Err(response) => return response,
    };

    let body_bytes: Bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read body").into_response(),
    };

    if body_bytes.is_empty() && close {
        return match state.store.close_stream(&path) {
            Ok(result) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(HEADER_STREAM_NEXT_OFFSET, result.offset.to_string())
                .header(HEADER_STREAM_CLOSED, "true")
                .body(Body::empty())
                .unwrap(),
            Err(e) => error_response(e),
        };
    }

    let opts = AppendOptions {
        seq,
        content_type,
        close,
        producer_id,
        producer_epoch,
        producer_seq,
    };
    match state.store.append(&path, &body_bytes, opts) {
        Ok(result) => {
            let status = if result.producer == ProducerOutcome::Duplicate {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::OK
            };
            let mut response = Response::builder()
                .status(status)
                .header(HEADER_STREAM_NEXT_OFFSET, result.offset.to_string());
            if result.closed {
                response = response.header(HEADER_STREAM_CLOSED, "true");
            }
            response.body(Body::empty()).unwrap()
        }
        Err(e) => error_response(e),
    }
}

/// DELETE - remove a stream.
async fn handle_delete(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = format!("/{path}");
    match state.store.delete(&path) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Build a 200 read response with the protocol headers.
#[allow(clippy::too_many_arguments)]
fn read_response(
    content_type: &str,
    closed: bool,
    path: &str,
    start_offset: Offset,
    next_offset: Offset,
    up_to_date: bool,
    cursor: u64,
    messages: &[StreamMessage],
) -> Response {
    let body = format_body(content_type, messages);
    let etag = generate_etag(path, &start_offset.to_string(), &next_offset.to_string());

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(HEADER_STREAM_NEXT_OFFSET, next_offset.to_string())
        .header(HEADER_STREAM_UP_TO_DATE, up_to_date.to_string())
        .header(HEADER_STREAM_CURSOR, cursor.to_string())
        .header(header::ETAG, etag);
    if closed {
        response = response.header(HEADER_STREAM_CLOSED, "true");
    }
    response.body(Body::from(body)).unwrap()
}

/// Render a batch of messages as one response body: JSON streams become a
/// JSON array of the stored values, anything else concatenates raw bytes.
fn format_body(content_type: &str, messages: &[StreamMessage]) -> Vec<u8> {
    if is_json_content_type(content_type) {
        let mut body = Vec::with_capacity(
            2 + messages.iter().map(|m| m.data.len() + 1).sum::<usize>(),
        );
        body.push(b'[');
        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(&message.data);
        }
        body.push(b']');
        body
    } else {
        messages
            .iter()
            .flat_map(|m| m.data.iter().copied())
            .collect()
    }
}

fn encode_sse_data(data: &[u8], base64_encode: bool) -> String {
    if base64_encode {
        base64::engine::general_purpose::STANDARD.encode(data)
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

/// Content types whose payloads are safe to put on the SSE wire verbatim.
fn is_textual_content_type(content_type: &str) -> bool {
    let media = normalize_content_type(content_type);
    media.starts_with("text/") || media == "application/json" || media.ends_with("+json")
}

/// Translate a store error into its HTTP response, attaching producer
/// diagnostic headers where the protocol defines them.
fn error_response(err: StoreError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }

    let mut response = Response::builder().status(status);
    match &err {
        StoreError::StaleEpoch { current, .. } => {
            response = response.header(HEADER_PRODUCER_EPOCH, current.to_string());
        }
        StoreError::ProducerSeqGap { expected, received } => {
            response = response
                .header(HEADER_PRODUCER_EXPECTED_SEQ, expected.to_string())
                .header(HEADER_PRODUCER_RECEIVED_SEQ, received.to_string());
        }
        _ => {}
    }
    response.body(Body::from(err.to_string())).unwrap()
}

/// Generate an ETag for a read response.
fn generate_etag(path: &str, start_offset: &str, end_offset: &str) -> String {
    let path_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(path);
    format!("\"{path_b64}:{start_offset}:{end_offset}\"")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_is_true(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn parse_ttl_header(headers: &HeaderMap) -> Result<Option<u64>, StoreError> {
    match header_str(headers, HEADER_STREAM_TTL) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| StoreError::InvalidTtl),
    }
}

fn parse_expires_at_header(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, StoreError> {
    match header_str(headers, HEADER_STREAM_EXPIRES_AT) {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(v)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StoreError::InvalidExpiresAt),
    }
}

fn parse_i64_header(headers: &HeaderMap, name: &str) -> Result<Option<i64>, Response> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| {
            (StatusCode::BAD_REQUEST, format!("invalid {name} header")).into_response()
        }),
    }
}

/// Open the store and serve the protocol until the listener fails.
pub async fn start_server(options: ServerOptions) -> Result<(), StoreError> {
    let store = StreamStore::open(options.store_options())?;
    let state = AppState {
        store,
        options: options.clone(),
    };
    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!(addr = %addr, "starting durable stream server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
