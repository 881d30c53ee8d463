//! Server-side subscriptions.
//!
//! [`BraidResponse::start_subscription`] turns a response into a long-lived
//! stream: status 209, no caching, no proxy buffering, and no idle timeout.
//! Updates are then pushed with [`BraidResponse::send_update`].
//!
//! If the request carried `Heartbeats: <seconds>`, a blank line is written
//! right away and then once per interval, until the response is ended or the
//! client goes away. Heartbeats carry no data and are skipped by readers.

use super::response::{BraidResponse, ConnectionEvent};
use crate::core::error::{BraidError, Result};
use crate::core::protocol::constants::{headers, CRLF, SUBSCRIPTION_CACHE_CONTROL};
use crate::core::protocol::parse_heartbeat;
use http::header::CACHE_CONTROL;
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type OnClose = Box<dyn FnOnce() + Send>;

/// Options for [`BraidResponse::start_subscription`].
#[derive(Default)]
pub struct SubscriptionOptions {
    on_close: Option<OnClose>,
}

impl SubscriptionOptions {
    /// Options with no callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `f` once when the subscription closes, finishes or is aborted.
    #[must_use]
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

impl BraidResponse {
    /// Put the response in subscription mode and flush its head.
    ///
    /// Calling it again only registers the new `on_close` callback.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Usage`](crate::BraidError::Usage) if the head of
    /// a non-subscription response was already sent, and
    /// [`BraidError::ResponseClosed`](crate::BraidError::ResponseClosed) if
    /// the client is gone.
    pub fn start_subscription(&self, options: SubscriptionOptions) -> Result<()> {
        if !self.is_subscription() && self.headers_sent() {
            return Err(BraidError::Usage(
                "start_subscription after the response head was sent".into(),
            ));
        }

        if let Some(on_close) = options.on_close {
            let connected = Arc::new(AtomicBool::new(true));
            let callback = Mutex::new(Some(on_close));
            self.on_event(move |event| {
                if connected.swap(false, Ordering::SeqCst) {
                    tracing::debug!("Subscription ended by {:?}", event);
                    if let Some(f) = callback.lock().take() {
                        f();
                    }
                }
            });
        }

        if self.is_subscription() {
            return Ok(());
        }

        self.sink().disable_idle_timeout();
        self.set_status(StatusCode::from_u16(209).unwrap_or(StatusCode::OK))?;

        let subscribe = self
            .context()
            .subscribe
            .as_ref()
            .map_or("true", |s| s.as_header_value())
            .to_string();
        self.set_header(headers::SUBSCRIBE.as_str(), subscribe)?;
        self.insert_header(CACHE_CONTROL, HeaderValue::from_static(SUBSCRIPTION_CACHE_CONTROL))?;
        self.insert_header(headers::X_ACCEL_BUFFERING, HeaderValue::from_static("no"))?;

        let heartbeat = self.context().heartbeats.clone().and_then(|raw| {
            parse_heartbeat(&raw).map(|interval| (raw, interval))
        });
        if let Some((raw, _)) = &heartbeat {
            self.set_header(headers::HEARTBEATS.as_str(), raw)?;
        }

        self.mark_subscription();
        self.flush_head()?;
        tracing::info!("Subscription started");

        if let Some((_, interval)) = heartbeat {
            spawn_heartbeats(self, interval);
        }
        Ok(())
    }
}

fn spawn_heartbeats(res: &BraidResponse, interval: std::time::Duration) {
    let weak = res.downgrade();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_close = stop.clone();
    res.on_event(move |event| {
        if matches!(event, ConnectionEvent::Close | ConnectionEvent::Finish) {
            stop_on_close.store(true, Ordering::SeqCst);
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let Some(res) = weak.upgrade() else {
                break;
            };
            if !res.is_writable() || res.write(CRLF).is_err() {
                break;
            }
        }
        tracing::debug!("Heartbeats stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::server::response::{ResponseBody, ResponseContext};
    use crate::core::types::{SubscribeMode, Update, Version};
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn next_bytes(body: &mut ResponseBody) -> Vec<u8> {
        body.next().await.unwrap().unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_subscription_head() {
        let context = ResponseContext {
            subscribe: Some(SubscribeMode::Descriptor("keep".into())),
            ..Default::default()
        };
        let (res, head_rx, _body) = BraidResponse::channel(context, None);
        res.start_subscription(SubscriptionOptions::new()).unwrap();

        let head = head_rx.await.unwrap();
        assert_eq!(head.status.as_u16(), 209);
        assert_eq!(head.headers["subscribe"], "keep");
        assert_eq!(head.headers["cache-control"], "no-cache, no-transform, no-store");
        assert_eq!(head.headers["x-accel-buffering"], "no");
        assert!(head.headers.get("heartbeats").is_none());
        assert!(res.is_subscription());
    }

    #[tokio::test]
    async fn test_two_updates_are_framed_separately() {
        let (res, head_rx, mut body) = BraidResponse::channel(ResponseContext::default(), None);
        res.start_subscription(SubscriptionOptions::new()).unwrap();
        assert_eq!(head_rx.await.unwrap().headers["subscribe"], "true");

        res.send_update(&Update::body("a").with_version(Version::new("v1"))).unwrap();
        res.send_update(&Update::body("bc").with_version(Version::new("v2"))).unwrap();

        assert_eq!(
            next_bytes(&mut body).await,
            b"HTTP 200 OK\r\nVersion: \"v1\"\r\nContent-Length: 1\r\n\r\na\r\n\r\n"
        );
        assert_eq!(
            next_bytes(&mut body).await,
            b"HTTP 200 OK\r\nVersion: \"v2\"\r\nContent-Length: 2\r\n\r\nbc\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_on_close_fires_once() {
        let (res, _head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        res.start_subscription(SubscriptionOptions::new().on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        res.end();
        drop(body);
        res.emit(ConnectionEvent::Abort);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_start_leaves_no_callback() {
        let (res, _head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
        res.write("already answered").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let err = res
            .start_subscription(SubscriptionOptions::new().on_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        assert!(matches!(err, BraidError::Usage(_)));
        assert!(!res.is_subscription());

        res.end();
        drop(body);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_keeps_head() {
        let (res, _head_rx, _body) = BraidResponse::channel(ResponseContext::default(), None);
        res.start_subscription(SubscriptionOptions::new()).unwrap();
        res.start_subscription(SubscriptionOptions::new()).unwrap();
        assert!(res.is_writable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_write_blank_lines() {
        let context = ResponseContext {
            heartbeats: Some("2".into()),
            ..Default::default()
        };
        let (res, head_rx, mut body) = BraidResponse::channel(context, None);
        res.start_subscription(SubscriptionOptions::new()).unwrap();
        assert_eq!(head_rx.await.unwrap().headers["heartbeats"], "2");

        let start = tokio::time::Instant::now();
        assert_eq!(next_bytes(&mut body).await, b"\r\n");
        assert_eq!(next_bytes(&mut body).await, b"\r\n");
        assert!(start.elapsed() >= Duration::from_secs(2));

        res.end();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_bad_heartbeats_are_ignored() {
        let context = ResponseContext {
            heartbeats: Some("often".into()),
            ..Default::default()
        };
        let (res, head_rx, _body) = BraidResponse::channel(context, None);
        res.start_subscription(SubscriptionOptions::new()).unwrap();
        assert!(head_rx.await.unwrap().headers.get("heartbeats").is_none());
    }
}
