//! The outgoing half of a Braid exchange.
//!
//! A [`BraidResponse`] is a handle on a response that may outlive the handler
//! that created it. Handlers set a status and headers, then write bytes; the
//! head is flushed on the first write. Where the bytes go is decided by a
//! [`ResponseSink`]:
//!
//! | Sink | Used for |
//! |------|----------|
//! | `ChannelSink` | Direct responses; bytes are streamed to the client |
//! | `MultiplexedSink` | `Multiplex-Through` requests; bytes are framed into a multiplexer |
//!
//! Close, finish and abort are reported as [`ConnectionEvent`]s. Each event
//! fires at most once, and a listener registered after an event already
//! fired is called with it immediately.

use crate::core::error::{BraidError, Result};
use crate::core::types::SubscribeMode;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle events of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The underlying connection went away.
    Close,
    /// The response was ended by the server.
    Finish,
    /// The request was abandoned before a response was produced.
    Abort,
}

type Listener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct HubState {
    closed: bool,
    finished: bool,
    aborted: bool,
    listeners: Vec<Listener>,
}

/// Fan-out of [`ConnectionEvent`]s to registered listeners.
#[derive(Default)]
pub(crate) struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub(crate) fn subscribe(&self, listener: Listener) {
        let replay: Vec<ConnectionEvent> = {
            let mut state = self.state.lock();
            state.listeners.push(listener.clone());
            [
                (state.finished, ConnectionEvent::Finish),
                (state.closed, ConnectionEvent::Close),
                (state.aborted, ConnectionEvent::Abort),
            ]
            .into_iter()
            .filter_map(|(seen, event)| seen.then_some(event))
            .collect()
        };
        for event in replay {
            listener(event);
        }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let listeners = {
            let mut state = self.state.lock();
            let seen = match event {
                ConnectionEvent::Close => &mut state.closed,
                ConnectionEvent::Finish => &mut state.finished,
                ConnectionEvent::Abort => &mut state.aborted,
            };
            if *seen {
                return;
            }
            *seen = true;
            state.listeners.clone()
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.aborted
    }
}

/// Status and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code.
    pub status: StatusCode,
    /// Header fields.
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        ResponseHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// Destination of the bytes written to a [`BraidResponse`].
pub(crate) trait ResponseSink: Send + Sync {
    /// Deliver the head. Called at most once, before any data.
    fn send_head(&self, head: ResponseHead) -> Result<()>;

    /// Deliver a chunk of body bytes.
    fn send_data(&self, data: Bytes) -> Result<()>;

    /// End the body normally.
    fn finish(&self);

    /// Tear the response down without a normal end.
    fn destroy(&self);

    /// Keep the response open regardless of idle time.
    fn disable_idle_timeout(&self) {}
}

/// Sink feeding a streamed axum body through channels.
pub(crate) struct ChannelSink {
    head: Mutex<Option<oneshot::Sender<ResponseHead>>>,
    body: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    keep_alive: Arc<AtomicBool>,
}

impl ResponseSink for ChannelSink {
    fn send_head(&self, head: ResponseHead) -> Result<()> {
        let tx = self
            .head
            .lock()
            .take()
            .ok_or_else(|| BraidError::Internal("response head sent twice".into()))?;
        tx.send(head).map_err(|_| BraidError::ResponseClosed)
    }

    fn send_data(&self, data: Bytes) -> Result<()> {
        match &*self.body.lock() {
            Some(tx) => tx.send(data).map_err(|_| BraidError::ResponseClosed),
            None => Err(BraidError::ResponseClosed),
        }
    }

    fn finish(&self) {
        self.body.lock().take();
    }

    fn destroy(&self) {
        self.head.lock().take();
        self.body.lock().take();
    }

    fn disable_idle_timeout(&self) {
        self.keep_alive.store(true, Ordering::SeqCst);
    }
}

/// Streamed body of a direct response.
///
/// Dropping it (the client went away, or the body was fully sent) emits
/// [`ConnectionEvent::Close`].
pub(crate) struct ResponseBody {
    rx: mpsc::UnboundedReceiver<Bytes>,
    events: Arc<EventHub>,
    idle: Option<(Duration, Pin<Box<tokio::time::Sleep>>)>,
    keep_alive: Arc<AtomicBool>,
    done: bool,
}

impl Stream for ResponseBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if let Some((timeout, sleep)) = &mut this.idle {
                    sleep.as_mut().reset(tokio::time::Instant::now() + *timeout);
                }
                return Poll::Ready(Some(Ok(chunk)));
            }
            Poll::Ready(None) => {
                this.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if this.keep_alive.load(Ordering::SeqCst) {
            this.idle = None;
        }
        if let Some((_, sleep)) = &mut this.idle {
            if sleep.as_mut().poll(cx).is_ready() {
                tracing::debug!("Closing idle response");
                this.done = true;
                this.events.emit(ConnectionEvent::Close);
                return Poll::Ready(None);
            }
        }
        Poll::Pending
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.events.emit(ConnectionEvent::Close);
    }
}

/// Build an axum response from a flushed head and its streamed body.
pub(crate) fn streaming_response(head: ResponseHead, body: ResponseBody) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

/// Request facts a response needs later on.
#[derive(Clone, Debug)]
pub(crate) struct ResponseContext {
    pub(crate) subscribe: Option<SubscribeMode>,
    pub(crate) heartbeats: Option<String>,
    pub(crate) extra_newlines: usize,
}

impl Default for ResponseContext {
    fn default() -> Self {
        ResponseContext {
            subscribe: None,
            heartbeats: None,
            extra_newlines: 1,
        }
    }
}

enum HeadState {
    Pending(ResponseHead),
    Sent(StatusCode),
}

struct Inner {
    head: Mutex<HeadState>,
    sink: Box<dyn ResponseSink>,
    events: Arc<EventHub>,
    subscription: AtomicBool,
    ended: AtomicBool,
    context: ResponseContext,
}

/// Handle on an outgoing Braid response.
///
/// Cheap to clone; every clone refers to the same response. The response
/// stays open while a clone is alive and it has not been ended, so a
/// subscription is kept alive by storing a clone.
#[derive(Clone)]
pub struct BraidResponse {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BraidResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BraidResponse")
            .field("status", &self.status())
            .field("subscription", &self.is_subscription())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl BraidResponse {
    pub(crate) fn new(
        sink: Box<dyn ResponseSink>,
        events: Arc<EventHub>,
        context: ResponseContext,
    ) -> Self {
        BraidResponse {
            inner: Arc::new(Inner {
                head: Mutex::new(HeadState::Pending(ResponseHead::default())),
                sink,
                events,
                subscription: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                context,
            }),
        }
    }

    /// A response streamed to the client through channels.
    pub(crate) fn channel(
        context: ResponseContext,
        idle_timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<ResponseHead>, ResponseBody) {
        let events = Arc::new(EventHub::default());
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let keep_alive = Arc::new(AtomicBool::new(false));

        let sink = ChannelSink {
            head: Mutex::new(Some(head_tx)),
            body: Mutex::new(Some(body_tx)),
            keep_alive: keep_alive.clone(),
        };
        let body = ResponseBody {
            rx: body_rx,
            events: events.clone(),
            idle: idle_timeout.map(|t| (t, Box::pin(tokio::time::sleep(t)))),
            keep_alive,
            done: false,
        };
        (Self::new(Box::new(sink), events, context), head_rx, body)
    }

    pub(crate) fn context(&self) -> &ResponseContext {
        &self.inner.context
    }

    pub(crate) fn sink(&self) -> &dyn ResponseSink {
        self.inner.sink.as_ref()
    }

    pub(crate) fn mark_subscription(&self) -> bool {
        !self.inner.subscription.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn downgrade(&self) -> WeakBraidResponse {
        WeakBraidResponse(Arc::downgrade(&self.inner))
    }

    /// Current status (the one sent, once the head is flushed).
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &*self.inner.head.lock() {
            HeadState::Pending(head) => head.status,
            HeadState::Sent(status) => *status,
        }
    }

    /// Set the status code.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Usage`] once the head has been flushed.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        match &mut *self.inner.head.lock() {
            HeadState::Pending(head) => {
                head.status = status;
                Ok(())
            }
            HeadState::Sent(_) => Err(headers_sent()),
        }
    }

    /// Set a header, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Usage`] once the head has been flushed.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        match &mut *self.inner.head.lock() {
            HeadState::Pending(head) => {
                head.headers.insert(name, value);
                Ok(())
            }
            HeadState::Sent(_) => Err(headers_sent()),
        }
    }

    /// Set a header from strings.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::HeaderParse`] for an invalid name or value and
    /// [`BraidError::Usage`] once the head has been flushed.
    pub fn set_header(&self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_ref().as_bytes())
            .map_err(|e| BraidError::HeaderParse(format!("{}: {}", name.as_ref(), e)))?;
        let value = HeaderValue::from_str(value.as_ref())
            .map_err(|e| BraidError::HeaderParse(format!("{}: {}", name, e)))?;
        self.insert_header(name, value)
    }

    /// A header that has been set but not yet flushed.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        match &*self.inner.head.lock() {
            HeadState::Pending(head) => head.headers.get(name).cloned(),
            HeadState::Sent(_) => None,
        }
    }

    /// True once the status and headers have been sent.
    #[must_use]
    pub fn headers_sent(&self) -> bool {
        matches!(&*self.inner.head.lock(), HeadState::Sent(_))
    }

    /// Send the status and headers now.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::ResponseClosed`] if nobody is listening anymore.
    pub fn flush_head(&self) -> Result<()> {
        let mut state = self.inner.head.lock();
        if let HeadState::Pending(head) = &*state {
            let status = head.status;
            let HeadState::Pending(head) = std::mem::replace(&mut *state, HeadState::Sent(status))
            else {
                return Ok(());
            };
            self.inner.sink.send_head(head)?;
        }
        Ok(())
    }

    /// Write body bytes, flushing the head first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::ResponseClosed`] after [`end`](Self::end) or
    /// once the connection is gone.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        if !self.is_writable() {
            return Err(BraidError::ResponseClosed);
        }
        self.flush_head()?;
        self.inner.sink.send_data(data.into())
    }

    /// End the response. Later calls do nothing.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.flush_head() {
            tracing::debug!("Ending response without head: {}", e);
        }
        self.inner.sink.finish();
        self.inner.events.emit(ConnectionEvent::Finish);
    }

    /// Tear the response down without a normal end.
    pub(crate) fn destroy(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
        {
            let mut state = self.inner.head.lock();
            if let HeadState::Pending(head) = &*state {
                *state = HeadState::Sent(head.status);
            }
        }
        self.inner.sink.destroy();
        self.inner.events.emit(ConnectionEvent::Close);
    }

    /// Take the unsent head, retiring this handle.
    ///
    /// Used when the handler produced its own response instead of writing.
    pub(crate) fn take_pending_head(&self) -> Option<ResponseHead> {
        let head = {
            let mut state = self.inner.head.lock();
            let status = match &*state {
                HeadState::Pending(head) => head.status,
                HeadState::Sent(_) => return None,
            };
            match std::mem::replace(&mut *state, HeadState::Sent(status)) {
                HeadState::Pending(head) => head,
                HeadState::Sent(_) => return None,
            }
        };
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner.sink.destroy();
        Some(head)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.inner.events.emit(event);
    }

    /// True while writes can still reach the client.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.inner.ended.load(Ordering::SeqCst) && !self.inner.events.is_closed()
    }

    /// True after [`start_subscription`](Self::start_subscription).
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.inner.subscription.load(Ordering::SeqCst)
    }

    /// Observe close, finish and abort.
    pub fn on_event(&self, listener: impl Fn(ConnectionEvent) + Send + Sync + 'static) {
        self.inner.events.subscribe(Arc::new(listener));
    }

    /// True if both handles refer to the same response.
    #[must_use]
    pub fn ptr_eq(&self, other: &BraidResponse) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send an ordinary axum response through this one.
    ///
    /// Status and headers are merged into the pending head, then the body is
    /// streamed and the response ended.
    ///
    /// # Errors
    ///
    /// Fails if the head was already sent, the connection is gone, or the
    /// body stream errors.
    pub async fn adopt(&self, response: Response) -> Result<()> {
        let (parts, body) = response.into_parts();
        match &mut *self.inner.head.lock() {
            HeadState::Pending(head) => {
                head.status = parts.status;
                for name in parts.headers.keys() {
                    head.headers.remove(name);
                }
                for (name, value) in &parts.headers {
                    head.headers.append(name.clone(), value.clone());
                }
            }
            HeadState::Sent(_) => return Err(headers_sent()),
        }
        self.flush_head()?;

        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BraidError::BodyParse(e.to_string()))?;
            if !chunk.is_empty() {
                self.write(chunk)?;
            }
        }
        self.end();
        Ok(())
    }
}

fn headers_sent() -> BraidError {
    BraidError::Usage("headers already sent".into())
}

/// Non-owning handle, used by timers and teardown callbacks.
#[derive(Clone)]
pub(crate) struct WeakBraidResponse(Weak<Inner>);

impl WeakBraidResponse {
    pub(crate) fn upgrade(&self) -> Option<BraidResponse> {
        self.0.upgrade().map(|inner| BraidResponse { inner })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for BraidResponse {
    type Rejection = BraidError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<BraidResponse>()
            .cloned()
            .ok_or_else(|| BraidError::Internal("braidify middleware is not installed".into()))
    }
}
