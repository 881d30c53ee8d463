//! Axum middleware for Braid protocol support.
//!
//! [`BraidLayer::middleware`] installs [`braidify`] in front of the
//! application. For every request it:
//!
//! 1. answers the multiplexer endpoints itself (see [`super::multiplex`]),
//! 2. parses the Braid request headers into a [`BraidState`],
//! 3. hands the handler a [`BraidResponse`] through request extensions,
//!    writing either to the client or into a multiplexer when the request
//!    carries `Multiplex-Through`.
//!
//! Handlers may return an ordinary response, or write through the
//! [`BraidResponse`] extractor and return `()`. Once the handler has written,
//! its return value is ignored and the response is ended when it returns,
//! unless it started a subscription.

use super::config::ServerConfig;
use super::multiplex::{
    acknowledgement, bad_multiplexer, conflict, endpoint_target, serve_endpoint, through_target,
    MultiplexedSink, MultiplexerRegistry,
};
use super::response::{streaming_response, BraidResponse, ResponseContext, ResponseHead};
use crate::core::error::{BraidError, Result};
use crate::core::protocol::constants::{headers, MULTIPLEX_PROTOCOL_VERSION};
use crate::core::protocol::{parse_patches_count, parse_subscribe, parse_version_header};
use crate::core::types::{ContentRange, SubscribeMode, Version};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Newtype wrapper indicating Firefox browser detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsFirefox(pub bool);

impl IsFirefox {
    /// Detect Firefox from the `User-Agent` header.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        IsFirefox(
            headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ua| ua.to_lowercase().contains("firefox")),
        )
    }
}

/// Braid protocol state extracted from HTTP request headers.
///
/// Available to handlers as `Extension<Arc<BraidState>>`, and through
/// [`BraidRequest`](super::BraidRequest).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BraidState {
    pub version: Option<Vec<Version>>,
    pub parents: Option<Vec<Version>>,
    pub peer: Option<String>,
    pub subscribe: Option<SubscribeMode>,
    /// Raw `Heartbeats` value; parsed when a subscription starts.
    pub heartbeats: Option<String>,
    pub patches_count: Option<usize>,
    pub content_range: Option<ContentRange>,
    pub multiplex_through: Option<String>,
    pub multiplex_version: Option<String>,
}

impl BraidState {
    /// Parse the Braid request headers.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::HeaderParse`] for a malformed `Version`,
    /// `Parents`, `Patches` or `Content-Range` value.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let text = |name: &http::HeaderName| -> Result<Option<String>> {
            headers
                .get(name)
                .map(|v| {
                    v.to_str().map(str::to_string).map_err(|_| {
                        BraidError::HeaderParse(format!("{} is not valid ASCII", name))
                    })
                })
                .transpose()
        };

        Ok(BraidState {
            version: text(&headers::VERSION)?
                .map(|v| parse_version_header(&v))
                .transpose()?,
            parents: text(&headers::PARENTS)?
                .map(|v| parse_version_header(&v))
                .transpose()?,
            peer: text(&headers::PEER)?,
            subscribe: text(&headers::SUBSCRIBE)?.map(|v| parse_subscribe(&v)),
            heartbeats: text(&headers::HEARTBEATS)?,
            patches_count: text(&headers::PATCHES)?
                .map(|v| parse_patches_count(&v))
                .transpose()?,
            content_range: text(&headers::CONTENT_RANGE)?
                .map(|v| ContentRange::from_header_value(&v))
                .transpose()?,
            multiplex_through: text(&headers::MULTIPLEX_THROUGH)?,
            multiplex_version: text(&headers::MULTIPLEX_VERSION)?,
        })
    }

    /// True if the request asked for a subscription.
    #[inline]
    #[must_use]
    pub fn is_subscribe(&self) -> bool {
        self.subscribe.is_some()
    }
}

/// Axum middleware layer for Braid protocol support.
///
/// Cloning shares the multiplexer registry, so one layer (and its clones)
/// serves one set of multiplexers.
#[derive(Clone, Debug, Default)]
pub struct BraidLayer {
    config: ServerConfig,
    multiplexers: MultiplexerRegistry,
}

impl BraidLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            multiplexers: MultiplexerRegistry::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The live multiplexers of this layer.
    #[inline]
    #[must_use]
    pub fn multiplexers(&self) -> &MultiplexerRegistry {
        &self.multiplexers
    }

    #[must_use]
    pub fn middleware(
        &self,
    ) -> impl tower::Layer<
        axum::routing::Route,
        Service = impl tower::Service<
            Request,
            Response = Response,
            Error = std::convert::Infallible,
            Future = impl Send + 'static,
        > + Clone
                      + Send
                      + Sync
                      + 'static,
    > + Clone {
        axum::middleware::from_fn_with_state(self.clone(), braidify)
    }
}

/// The Braid middleware function.
///
/// Usually installed through [`BraidLayer::middleware`]; exposed for
/// `axum::middleware::from_fn_with_state` users.
///
/// Every answer it produces advertises range requests, including
/// multiplexer endpoint replies, rejections and `293` acknowledgements.
pub async fn braidify(State(layer): State<BraidLayer>, req: Request, next: Next) -> Response {
    let mut response = route(&layer, req, next).await;
    for (name, value) in range_request_headers() {
        response.headers_mut().entry(name).or_insert(value);
    }
    response
}

async fn route(layer: &BraidLayer, mut req: Request, next: Next) -> Response {
    if layer.config.enable_multiplex {
        if let Some(target) = endpoint_target(req.method(), req.uri().path()) {
            return serve_endpoint(&layer.multiplexers, &req, target);
        }
    }

    let state = match BraidState::from_headers(req.headers()) {
        Ok(state) => state,
        Err(e) => return e.into_response(),
    };
    let is_firefox = IsFirefox::from_headers(req.headers());
    let context = ResponseContext {
        subscribe: state.subscribe.clone(),
        heartbeats: state.heartbeats.clone(),
        extra_newlines: layer.config.extra_newlines(is_firefox.0),
    };
    let through = state
        .multiplex_through
        .clone()
        .filter(|_| layer.config.enable_multiplex)
        .filter(|_| state.multiplex_version.as_deref() == Some(MULTIPLEX_PROTOCOL_VERSION));

    req.extensions_mut().insert(Arc::new(state));
    req.extensions_mut().insert(is_firefox);

    match through {
        Some(through) => forward(layer, req, next, &through, context).await,
        None => respond_directly(layer, req, next, context).await,
    }
}

fn range_request_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (
            headers::RANGE_REQUEST_ALLOW_METHODS,
            HeaderValue::from_static("PATCH, PUT"),
        ),
        (
            headers::RANGE_REQUEST_ALLOW_UNITS,
            HeaderValue::from_static("json"),
        ),
    ]
}

fn spawn_handler(req: Request, next: Next) -> JoinHandle<Response> {
    tokio::spawn(next.run(req).in_current_span())
}

/// Emits [`ConnectionEvent::Abort`](super::ConnectionEvent::Abort) and
/// cancels the handler if the request is dropped before it was answered.
struct AbortGuard {
    res: Option<BraidResponse>,
    handler: tokio::task::AbortHandle,
}

impl AbortGuard {
    fn disarm(mut self) {
        self.res = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(res) = self.res.take() {
            tracing::debug!("Request dropped before it was answered");
            self.handler.abort();
            res.emit(super::ConnectionEvent::Abort);
        }
    }
}

/// End the response once the handler returns, unless it subscribed.
fn end_after(res: BraidResponse, handler: JoinHandle<Response>) {
    tokio::spawn(async move {
        if let Err(e) = handler.await {
            tracing::error!("Handler failed after writing: {}", e);
        }
        if !res.is_subscription() {
            res.end();
        }
    });
}

async fn respond_directly(
    layer: &BraidLayer,
    mut req: Request,
    next: Next,
    context: ResponseContext,
) -> Response {
    let (res, mut head_rx, body) = BraidResponse::channel(context, layer.config.idle_timeout);
    req.extensions_mut().insert(res.clone());

    let mut handler = spawn_handler(req, next);
    let guard = AbortGuard {
        res: Some(res.clone()),
        handler: handler.abort_handle(),
    };

    tokio::select! {
        biased;
        head = &mut head_rx => {
            guard.disarm();
            match head {
                Ok(head) => {
                    end_after(res, handler);
                    streaming_response(head, body)
                }
                Err(_) => handler_output(handler.await),
            }
        }
        output = &mut handler => {
            guard.disarm();
            let response = handler_output(output);
            match res.take_pending_head() {
                Some(head) => merge_head(head, response),
                // Written from another task just as the handler returned.
                None => match head_rx.await {
                    Ok(head) => {
                        if !res.is_subscription() {
                            res.end();
                        }
                        streaming_response(head, body)
                    }
                    Err(_) => response,
                },
            }
        }
    }
}

async fn forward(
    layer: &BraidLayer,
    mut req: Request,
    next: Next,
    through: &str,
    context: ResponseContext,
) -> Response {
    let Some((multiplexer_id, request_id)) = through_target(through) else {
        return BraidError::HeaderParse(format!("Multiplex-Through {:?}", through)).into_response();
    };
    let Some(multiplexer) = layer.multiplexers.get(&multiplexer_id) else {
        tracing::debug!("Multiplex-Through names unknown multiplexer {}", multiplexer_id);
        return bad_multiplexer(
            BraidError::MultiplexerMissing(multiplexer_id.clone()),
            &multiplexer_id,
        );
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let sink = MultiplexedSink::new(&multiplexer, &request_id, ack_tx);
    let res = BraidResponse::new(Box::new(sink), Default::default(), context);

    let weak = res.downgrade();
    let teardown = Box::new(move || {
        if let Some(res) = weak.upgrade() {
            res.destroy();
        }
    });
    match multiplexer.open_request(&request_id, teardown) {
        Ok(()) => {}
        Err(e @ BraidError::Conflict(_)) => return conflict("Request already multiplexed", e),
        Err(e) => {
            tracing::debug!("Multiplexer {} is closing: {}", multiplexer_id, e);
            return bad_multiplexer(
                BraidError::MultiplexerMissing(multiplexer_id.clone()),
                &multiplexer_id,
            );
        }
    }
    tracing::debug!("Request {} forwarded to multiplexer {}", request_id, multiplexer_id);

    for (name, value) in range_request_headers() {
        let _ = res.insert_header(name, value);
    }
    req.extensions_mut().insert(res.clone());
    let handler = spawn_handler(req, next);

    let virtual_res = res.clone();
    tokio::spawn(
        async move {
            match handler.await {
                Ok(response) if !virtual_res.headers_sent() => {
                    if let Err(e) = virtual_res.adopt(response).await {
                        tracing::debug!("Forwarded response failed: {}", e);
                        virtual_res.destroy();
                    }
                }
                Ok(_) => {
                    if !virtual_res.is_subscription() {
                        virtual_res.end();
                    }
                }
                Err(e) => {
                    tracing::error!("Forwarded handler failed: {}", e);
                    virtual_res.destroy();
                }
            }
        }
        .in_current_span(),
    );
    drop(res);

    let through = HeaderValue::from_str(through).unwrap_or_else(|_| HeaderValue::from_static(""));
    match ack_rx.await {
        Ok(cors) => acknowledgement(&through, cors),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn handler_output(output: std::result::Result<Response, tokio::task::JoinError>) -> Response {
    output.unwrap_or_else(|e| {
        tracing::error!("Handler failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

/// Add headers set on the Braid response that the returned one lacks.
fn merge_head(head: ResponseHead, mut response: Response) -> Response {
    let existing: HashSet<HeaderName> = response.headers().keys().cloned().collect();
    let mut current = None;
    for (name, value) in head.headers {
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = &current else {
            continue;
        };
        if !existing.contains(name) {
            response.headers_mut().append(name.clone(), value);
        }
    }
    response
}
