//! Server-side connection multiplexing.
//!
//! A multiplexer is one long-lived response (the *physical* stream) that
//! carries many *virtual* responses, framed with
//! [`MultiplexEvent`](crate::protocol::MultiplexEvent) lines.
//!
//! # Endpoints
//!
//! | Request | Effect |
//! |---------|--------|
//! | `MULTIPLEX /<m>` or `POST /.well-known/multiplexer/<m>` | Create multiplexer `m` |
//! | `MULTIPLEX /<m>/<r>` or `POST /.well-known/multiplexer/<m>/<r>` | Tear down request `r` |
//! | `OPTIONS` on either form | CORS preflight, empty 200 |
//! | Any request with `Multiplex-Through: /.well-known/multiplexer/<m>/<r>` | Answer through `m` |
//!
//! A forwarded request gets a short `293` acknowledgement on its own
//! connection; the real response travels through the multiplexer.
//!
//! Closing the physical stream tears down every virtual response on it and
//! removes the multiplexer from its [`MultiplexerRegistry`].

use super::response::{streaming_response, BraidResponse, ResponseContext, ResponseHead, ResponseSink};
use crate::core::error::{BraidError, Result};
use crate::core::protocol::constants::{
    headers, status, CRLF, MULTIPLEX_METHOD, MULTIPLEX_PROTOCOL_VERSION, WELL_KNOWN_MULTIPLEXER_PREFIX,
};
use crate::core::protocol::{reason_phrase, MultiplexEvent};
use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, CACHE_CONTROL, CONNECTION,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version as HttpVersion};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type Teardown = Box<dyn FnOnce() + Send>;

/// One multiplexer: a physical response and the virtual requests it hosts.
pub struct Multiplexer {
    id: String,
    physical: BraidResponse,
    requests: Mutex<HashMap<String, Teardown>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("requests", &self.request_count())
            .finish()
    }
}

impl Multiplexer {
    /// The multiplexer id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of virtual requests registered.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// True if `request_id` is registered.
    #[must_use]
    pub fn has_request(&self, request_id: &str) -> bool {
        self.requests.lock().contains_key(request_id)
    }

    /// Register a virtual request and announce it on the physical stream.
    ///
    /// # Errors
    ///
    /// [`BraidError::Conflict`] if the id is taken, or the physical stream's
    /// write error.
    pub(crate) fn open_request(&self, request_id: &str, teardown: Teardown) -> Result<()> {
        let mut requests = self.requests.lock();
        if requests.contains_key(request_id) {
            return Err(BraidError::Conflict(format!(
                "Cannot multiplex request with duplicate ID '{}' for multiplexer '{}'",
                request_id, self.id
            )));
        }
        self.physical
            .write(MultiplexEvent::StartResponse(request_id.to_string()).encode())?;
        requests.insert(request_id.to_string(), teardown);
        Ok(())
    }

    /// Write one frame to the physical stream.
    pub(crate) fn write_event(&self, event: &MultiplexEvent) -> Result<()> {
        self.physical.write(event.encode())
    }

    pub(crate) fn remove_request(&self, request_id: &str) -> Option<Teardown> {
        self.requests.lock().remove(request_id)
    }

    fn teardown_all(&self) {
        let teardowns: Vec<(String, Teardown)> = self.requests.lock().drain().collect();
        for (request_id, teardown) in teardowns {
            tracing::debug!("Tearing down {} on closed multiplexer {}", request_id, self.id);
            teardown();
        }
    }
}

/// Live multiplexers by id.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct MultiplexerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Multiplexer>>>>,
}

impl std::fmt::Debug for MultiplexerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerRegistry")
            .field("multiplexers", &self.len())
            .finish()
    }
}

impl MultiplexerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a multiplexer on `physical`.
    ///
    /// The entry is removed, and its virtual requests torn down, when the
    /// physical response closes or finishes.
    ///
    /// # Errors
    ///
    /// [`BraidError::Conflict`] if the id is taken.
    pub(crate) fn create(&self, id: &str, physical: BraidResponse) -> Result<Arc<Multiplexer>> {
        let multiplexer = {
            let mut map = self.inner.lock();
            if map.contains_key(id) {
                return Err(BraidError::Conflict(format!(
                    "Cannot create duplicate multiplexer with ID '{}'",
                    id
                )));
            }
            let multiplexer = Arc::new(Multiplexer {
                id: id.to_string(),
                physical: physical.clone(),
                requests: Mutex::new(HashMap::new()),
            });
            map.insert(id.to_string(), multiplexer.clone());
            multiplexer
        };

        let registry = Arc::downgrade(&self.inner);
        let weak = Arc::downgrade(&multiplexer);
        physical.on_event(move |event| {
            let Some(multiplexer) = weak.upgrade() else {
                return;
            };
            if let Some(registry) = registry.upgrade() {
                let mut map = registry.lock();
                if map
                    .get(&multiplexer.id)
                    .is_some_and(|m| Arc::ptr_eq(m, &multiplexer))
                {
                    map.remove(&multiplexer.id);
                }
            }
            tracing::info!("Multiplexer {} closed ({:?})", multiplexer.id, event);
            multiplexer.teardown_all();
        });

        Ok(multiplexer)
    }

    /// Look up a multiplexer.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Multiplexer>> {
        self.inner.lock().get(id).cloned()
    }

    /// Number of live multiplexers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if no multiplexer is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Sink framing a virtual response into its multiplexer.
///
/// The first head, finish or teardown releases the acknowledgement for the
/// forwarded request's own connection.
pub(crate) struct MultiplexedSink {
    multiplexer: Weak<Multiplexer>,
    request_id: String,
    ack: Mutex<Option<oneshot::Sender<HeaderMap>>>,
}

impl MultiplexedSink {
    pub(crate) fn new(
        multiplexer: &Arc<Multiplexer>,
        request_id: &str,
        ack: oneshot::Sender<HeaderMap>,
    ) -> Self {
        MultiplexedSink {
            multiplexer: Arc::downgrade(multiplexer),
            request_id: request_id.to_string(),
            ack: Mutex::new(Some(ack)),
        }
    }

    fn acknowledge(&self, cors: HeaderMap) {
        if let Some(tx) = self.ack.lock().take() {
            let _ = tx.send(cors);
        }
    }

    fn send_event(&self, event: MultiplexEvent) -> Result<()> {
        let multiplexer = self.multiplexer.upgrade().ok_or(BraidError::ResponseClosed)?;
        multiplexer.write_event(&event)
    }
}

impl ResponseSink for MultiplexedSink {
    fn send_head(&self, head: ResponseHead) -> Result<()> {
        self.acknowledge(cors_headers(&head.headers));

        let mut buffer = BytesMut::new();
        buffer.put_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                head.status.as_u16(),
                reason_phrase(head.status.as_u16())
            )
            .as_bytes(),
        );
        for (name, value) in &head.headers {
            buffer.put_slice(name.as_str().as_bytes());
            buffer.put_slice(b": ");
            buffer.put_slice(value.as_bytes());
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(b"\r\n");
        self.send_event(MultiplexEvent::data(self.request_id.clone(), buffer.freeze()))
    }

    fn send_data(&self, data: Bytes) -> Result<()> {
        self.send_event(MultiplexEvent::data(self.request_id.clone(), data))
    }

    fn finish(&self) {
        self.acknowledge(HeaderMap::new());
        if let Err(e) = self.send_event(MultiplexEvent::CloseResponse(self.request_id.clone())) {
            tracing::debug!("Could not close virtual response {}: {}", self.request_id, e);
        }
    }

    fn destroy(&self) {
        self.acknowledge(HeaderMap::new());
    }

    fn disable_idle_timeout(&self) {}
}

/// `Access-Control-*` headers a forwarded response carries back on its 293.
fn cors_headers(headers: &HeaderMap) -> HeaderMap {
    const COPIED: [&str; 6] = [
        "access-control-allow-origin",
        "access-control-allow-methods",
        "access-control-allow-headers",
        "access-control-allow-credentials",
        "access-control-expose-headers",
        "access-control-max-age",
    ];
    let mut out = HeaderMap::new();
    for name in COPIED {
        if let Some(value) = headers.get(name) {
            out.insert(http::HeaderName::from_static(name), value.clone());
        }
    }
    out
}

/// Multiplexer and request id addressed by a multiplexer endpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EndpointTarget {
    pub(crate) multiplexer: String,
    pub(crate) request: Option<String>,
}

/// Match a request against the multiplexer endpoints.
pub(crate) fn endpoint_target(method: &Method, path: &str) -> Option<EndpointTarget> {
    let segments: Vec<&str> = if method.as_str() == MULTIPLEX_METHOD {
        path.split('/').skip(1).collect()
    } else if path.starts_with(WELL_KNOWN_MULTIPLEXER_PREFIX) {
        path.split('/').skip(3).collect()
    } else {
        return None;
    };
    let mut segments = segments.into_iter();
    let multiplexer = segments.next().unwrap_or_default().to_string();
    let request = segments
        .next()
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    Some(EndpointTarget {
        multiplexer,
        request,
    })
}

/// Multiplexer and request id named by a `Multiplex-Through` header.
pub(crate) fn through_target(value: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = value.split('/').collect();
    match (segments.get(3), segments.get(4)) {
        (Some(m), Some(r)) if !m.is_empty() && !r.is_empty() => {
            Some((m.to_string(), r.to_string()))
        }
        _ => None,
    }
}

fn allow_all(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, any.clone());
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, any);
}

fn with_cors(response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    allow_all(response.headers_mut());
    response
}

fn multiplex_version_header() -> (http::HeaderName, HeaderValue) {
    (
        headers::MULTIPLEX_VERSION,
        HeaderValue::from_static(MULTIPLEX_PROTOCOL_VERSION),
    )
}

/// Answer a request addressed to a multiplexer endpoint.
pub(crate) fn serve_endpoint(
    registry: &MultiplexerRegistry,
    req: &Request,
    target: EndpointTarget,
) -> Response {
    if req.method() == Method::OPTIONS {
        return with_cors(StatusCode::OK);
    }

    let version = req
        .headers()
        .get(headers::MULTIPLEX_VERSION)
        .and_then(|v| v.to_str().ok());
    if version != Some(MULTIPLEX_PROTOCOL_VERSION) {
        tracing::debug!("Rejecting multiplexer request with version {:?}", version);
        return with_cors(BraidError::MultiplexVersion(version.map(str::to_string)));
    }

    if target.multiplexer.is_empty() {
        return with_cors(BraidError::Protocol("Missing multiplexer id".into()));
    }

    match target.request {
        None => create_multiplexer(registry, &target.multiplexer, req.version()),
        Some(request) => teardown_request(registry, &target.multiplexer, &request),
    }
}

fn create_multiplexer(registry: &MultiplexerRegistry, id: &str, version: HttpVersion) -> Response {
    let (physical, mut head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
    physical.sink().disable_idle_timeout();

    if let Err(e) = registry.create(id, physical.clone()) {
        tracing::debug!("Multiplexer {} already exists", id);
        return with_cors(conflict("Multiplexer already exists", e));
    }

    let mut fields = HeaderMap::new();
    allow_all(&mut fields);
    let (name, value) = multiplex_version_header();
    fields.insert(name, value);
    fields.insert(headers::INCREMENTAL, HeaderValue::from_static("?1"));
    fields.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    fields.insert(headers::X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    if version < HttpVersion::HTTP_2 {
        fields.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    for (name, value) in fields {
        if let Some(name) = name {
            let _ = physical.insert_header(name, value);
        }
    }

    // Flush the head right away so the client sees the stream open.
    if let Err(e) = physical.write(CRLF) {
        tracing::warn!("Multiplexer {} closed before it opened: {}", id, e);
    }
    tracing::info!("Multiplexer {} created", id);

    match head_rx.try_recv() {
        Ok(head) => streaming_response(head, body),
        Err(_) => with_cors(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn teardown_request(registry: &MultiplexerRegistry, id: &str, request: &str) -> Response {
    let Some(multiplexer) = registry.get(id) else {
        let error = BraidError::NotFound(format!("multiplexer {} does not exist", id));
        return with_cors(bad_multiplexer(error, id));
    };
    let Some(teardown) = multiplexer.remove_request(request) else {
        let error = BraidError::NotFound(format!("request {} does not exist", request));
        return with_cors(blame(error, headers::BAD_REQUEST, request));
    };

    teardown();
    tracing::debug!("Virtual request {} torn down on multiplexer {}", request, id);
    with_cors((StatusCode::OK, [multiplex_version_header()]))
}

/// `error` as a response naming the offending id in `header`.
fn blame(error: BraidError, header: http::HeaderName, id: &str) -> Response {
    let mut response = error.into_response();
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(header, value);
    }
    response
}

/// Answer for a request naming a multiplexer that does not exist.
pub(crate) fn bad_multiplexer(error: BraidError, id: &str) -> Response {
    blame(error, headers::BAD_MULTIPLEXER, id)
}

/// A 409 with a JSON `{error, details}` body.
pub(crate) fn conflict(summary: &str, error: BraidError) -> Response {
    let details = match error {
        BraidError::Conflict(details) => details,
        other => other.to_string(),
    };
    tracing::debug!("Conflict: {}", details);
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": summary, "details": details })),
    )
        .into_response()
}

/// The short answer on a forwarded request's own connection.
pub(crate) fn acknowledgement(through: &HeaderValue, cors: HeaderMap) -> Response {
    let mut response = Response::new(Body::from("Ok."));
    *response.status_mut() =
        StatusCode::from_u16(status::RESPONDED_VIA_MULTIPLEXER).unwrap_or(StatusCode::OK);
    let fields = response.headers_mut();
    fields.insert(headers::MULTIPLEX_THROUGH, through.clone());
    let (name, value) = multiplex_version_header();
    fields.insert(name, value);
    fields.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    fields.extend(cors);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::server::response::ResponseBody;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A physical stream whose head is already flushed, like one from
    /// `create_multiplexer`.
    async fn physical() -> (BraidResponse, ResponseBody) {
        let (res, head_rx, mut body) = BraidResponse::channel(ResponseContext::default(), None);
        res.write(CRLF).unwrap();
        head_rx.await.unwrap();
        assert_eq!(next_chunk(&mut body).await, CRLF);
        (res, body)
    }

    async fn next_chunk(body: &mut ResponseBody) -> Bytes {
        body.next().await.unwrap().unwrap()
    }

    #[test]
    fn test_endpoint_target_method_form() {
        let method = Method::from_bytes(b"MULTIPLEX").unwrap();
        assert_eq!(
            endpoint_target(&method, "/m1"),
            Some(EndpointTarget {
                multiplexer: "m1".into(),
                request: None
            })
        );
        assert_eq!(
            endpoint_target(&method, "/m1/r1").and_then(|t| t.request),
            Some("r1".into())
        );
    }

    #[test]
    fn test_endpoint_target_well_known_form() {
        let target = endpoint_target(&Method::POST, "/.well-known/multiplexer/m1/r2").unwrap();
        assert_eq!(target.multiplexer, "m1");
        assert_eq!(target.request.as_deref(), Some("r2"));
        assert!(endpoint_target(&Method::GET, "/doc").is_none());
    }

    #[test]
    fn test_through_target() {
        assert_eq!(
            through_target("/.well-known/multiplexer/m1/r1"),
            Some(("m1".into(), "r1".into()))
        );
        assert_eq!(through_target("/.well-known/multiplexer/m1"), None);
    }

    #[tokio::test]
    async fn test_duplicate_multiplexer_is_rejected() {
        let registry = MultiplexerRegistry::new();
        let (first, _b1) = physical().await;
        let (second, _b2) = physical().await;
        registry.create("m1", first).unwrap();
        assert!(matches!(
            registry.create("m1", second),
            Err(BraidError::Conflict(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_physical_close_tears_down_requests() {
        let registry = MultiplexerRegistry::new();
        let (res, body) = physical().await;
        let multiplexer = registry.create("m1", res).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        multiplexer
            .open_request(
                "a",
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        drop(body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("m1").is_none());
        assert_eq!(multiplexer.request_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_rejected() {
        let registry = MultiplexerRegistry::new();
        let (res, mut body) = physical().await;
        let multiplexer = registry.create("m1", res).unwrap();
        multiplexer.open_request("a", Box::new(|| {})).unwrap();
        assert_eq!(next_chunk(&mut body).await, "start response a\r\n");

        assert!(multiplexer.open_request("a", Box::new(|| {})).is_err());
        assert_eq!(multiplexer.request_count(), 1);
    }

    #[tokio::test]
    async fn test_virtual_response_is_framed() {
        let registry = MultiplexerRegistry::new();
        let (res, mut body) = physical().await;
        let multiplexer = registry.create("m1", res).unwrap();
        multiplexer.open_request("r", Box::new(|| {})).unwrap();
        let _ = next_chunk(&mut body).await;

        let (ack_tx, ack_rx) = oneshot::channel();
        let sink = MultiplexedSink::new(&multiplexer, "r", ack_tx);
        let virtual_res = BraidResponse::new(
            Box::new(sink),
            Default::default(),
            ResponseContext::default(),
        );
        virtual_res
            .set_header("access-control-allow-origin", "https://example.org")
            .unwrap();
        virtual_res.write("hi").unwrap();
        virtual_res.end();

        let cors = ack_rx.await.unwrap();
        assert_eq!(cors["access-control-allow-origin"], "https://example.org");

        let head = next_chunk(&mut body).await;
        let head = String::from_utf8(head.to_vec()).unwrap();
        assert!(head.starts_with("69 bytes for response r\r\nHTTP/1.1 200 OK\r\n"));
        assert!(head.ends_with("access-control-allow-origin: https://example.org\r\n\r\n"));
        assert_eq!(next_chunk(&mut body).await, "2 bytes for response r\r\nhi");
        assert_eq!(next_chunk(&mut body).await, "close response r\r\n");
    }

    #[test]
    fn test_acknowledgement() {
        let mut cors = HeaderMap::new();
        cors.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        let response = acknowledgement(
            &HeaderValue::from_static("/.well-known/multiplexer/m/r"),
            cors,
        );
        assert_eq!(response.status().as_u16(), 293);
        assert_eq!(response.headers()["multiplex-version"], "1.0");
        assert_eq!(response.headers()["cache-control"], "no-store");
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
