//! Pushing updates on a [`BraidResponse`].
//!
//! One method serves both response kinds:
//!
//! | Response | Headers | Content |
//! |----------|---------|---------|
//! | One-shot | Set on the HTTP head | HTTP body, framed by `Content-Length` |
//! | Subscription | Written as text lines into the open stream | Followed by blank-line separators |
//!
//! A patch update always goes out as a list, a single patch being a list of
//! one. On a one-shot response the count is a real `Patches: N` header and
//! the body holds the patch blocks.

use super::response::BraidResponse;
use crate::core::error::{BraidError, Result};
use crate::core::protocol::constants::headers;
use crate::core::protocol::{format_subscription_update, format_version_header, write_patch_blocks};
use crate::core::types::{Update, UpdateContent};
use bytes::BytesMut;
use http::header::CONTENT_LENGTH;
use http::{HeaderValue, StatusCode};

impl BraidResponse {
    /// Send one update.
    ///
    /// On a subscription this may be called any number of times; updates are
    /// written in call order. On a one-shot response it may be called once,
    /// before anything else has been written.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Usage`] for an invalid update or a one-shot
    /// response whose head is already sent, before any byte is written, and
    /// [`BraidError::ResponseClosed`] if the client is gone.
    pub fn send_update(&self, update: &Update) -> Result<()> {
        update.validate()?;

        if self.is_subscription() {
            let frame = format_subscription_update(update, self.context().extra_newlines);
            return self.write(frame);
        }

        if self.headers_sent() {
            return Err(BraidError::Usage(
                "send_update on a one-shot response that already sent its headers".into(),
            ));
        }

        if let Some(status) = update.status {
            let status = StatusCode::from_u16(status)
                .map_err(|e| BraidError::Usage(format!("status {}: {}", status, e)))?;
            self.set_status(status)?;
        }
        if !update.version.is_empty() {
            self.insert_header(headers::VERSION, header_value(&format_version_header(&update.version))?)?;
        }
        if !update.parents.is_empty() {
            self.insert_header(headers::PARENTS, header_value(&format_version_header(&update.parents))?)?;
        }
        for (name, value) in &update.extra_headers {
            self.set_header(name, value)?;
        }

        let body = match &update.content {
            UpdateContent::Body(body) => body.clone(),
            UpdateContent::Patches(patches) => {
                self.insert_header(headers::PATCHES, HeaderValue::from(patches.len()))?;
                let mut buffer = BytesMut::new();
                write_patch_blocks(&mut buffer, patches);
                buffer.freeze()
            }
        };

        self.insert_header(CONTENT_LENGTH, HeaderValue::from(body.len()))?;
        self.write(body)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| BraidError::HeaderParse(format!("{:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::server::response::{ResponseBody, ResponseContext};
    use crate::core::types::{Patch, Version};

    async fn drain(body: ResponseBody) -> Vec<u8> {
        use futures::StreamExt;
        let chunks: Vec<_> = body.collect().await;
        chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_one_shot_body() {
        let (res, head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
        res.send_update(&Update::body("hi")).unwrap();
        res.end();
        drop(res);

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers[CONTENT_LENGTH], "2");
        assert_eq!(drain(body).await, b"hi");
    }

    #[tokio::test]
    async fn test_one_shot_versions_and_status() {
        let (res, head_rx, _body) = BraidResponse::channel(ResponseContext::default(), None);
        let update = Update::body("x")
            .with_version(Version::new("v2"))
            .with_parent(Version::new("v1"))
            .with_status(201)
            .with_header("merge-type", "simple");
        res.send_update(&update).unwrap();

        let head = head_rx.await.unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.headers["version"], "\"v2\"");
        assert_eq!(head.headers["parents"], "\"v1\"");
        assert_eq!(head.headers["merge-type"], "simple");
    }

    #[tokio::test]
    async fn test_one_shot_single_patch_is_a_list_of_one() {
        let (res, head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
        res.send_update(&Update::patch(Patch::json(".a", "1"))).unwrap();
        res.end();
        drop(res);

        let head = head_rx.await.unwrap();
        assert_eq!(head.headers["patches"], "1");
        assert!(head.headers.get("content-range").is_none());
        assert_eq!(
            drain(body).await,
            b"Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1"
        );
    }

    #[tokio::test]
    async fn test_subscription_single_patch_is_a_list_of_one() {
        let (res, _head_rx, mut body) = BraidResponse::channel(ResponseContext::default(), None);
        res.start_subscription(Default::default()).unwrap();
        res.send_update(&Update::patch(Patch::json(".a", "1"))).unwrap();

        let frame = futures::StreamExt::next(&mut body).await.unwrap().unwrap();
        assert_eq!(
            String::from_utf8(frame.to_vec()).unwrap(),
            "HTTP 200 OK\r\nPatches: 1\r\n\r\n\
             Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_one_shot_patch_list() {
        let (res, head_rx, body) = BraidResponse::channel(ResponseContext::default(), None);
        let update = Update::patches(vec![Patch::json(".a", "1"), Patch::json(".b", "22")]);
        res.send_update(&update).unwrap();
        res.end();
        drop(res);

        let head = head_rx.await.unwrap();
        assert_eq!(head.headers["patches"], "2");
        let bytes = drain(body).await;
        assert_eq!(head.headers[CONTENT_LENGTH], bytes.len().to_string().as_str());
        assert!(bytes.starts_with(b"Content-Length: 1\r\nContent-Range: json .a\r\n\r\n1"));
    }

    #[tokio::test]
    async fn test_invalid_update_writes_nothing() {
        let (res, _head_rx, _body) = BraidResponse::channel(ResponseContext::default(), None);
        assert!(res.send_update(&Update::body("x").with_status(42)).is_err());
        assert!(res.send_update(&Update::patches(vec![])).is_err());
        assert!(!res.headers_sent());
        res.send_update(&Update::body("ok")).unwrap();
        assert!(matches!(
            res.send_update(&Update::body("again")),
            Err(BraidError::Usage(_))
        ));
    }
}
