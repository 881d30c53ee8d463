//! Parse incoming update requests for Braid protocol.
//!
//! # Request Formats Handled
//!
//! ## 1. BODY MODE (no `Patches`, no `Content-Range`):
//! ```text
//! PUT /resource HTTP/1.1
//! Content-Length: 16
//!
//! {"text": "hello"}
//! ```
//!
//! ## 2. SINGLE PATCH MODE:
//! ```text
//! PUT /resource HTTP/1.1
//! Content-Range: json .path.to.field
//! Content-Length: 3
//!
//! "x"
//! ```
//!
//! ## 3. MULTIPLE PATCHES MODE:
//! ```text
//! PUT /resource HTTP/1.1
//! Patches: 2
//!
//! Content-Length: 1
//! Content-Range: json .a
//!
//! 1
//!
//! Content-Length: 2
//! Content-Range: json .b
//!
//! 22
//! ```
//!
//! Multi-patch bodies are parsed incrementally as chunks arrive. A body that
//! ends before every announced patch arrived still yields the patches that
//! did, with [`ParsedUpdate::incomplete`] set.

use super::middleware::BraidState;
use crate::core::error::{BraidError, Result};
use crate::core::protocol::constants::headers;
use crate::core::protocol::{parse_patches_count, parse_version_header, PatchScanner, ScanStatus};
use crate::core::types::{ContentRange, Patch, SubscribeMode, Update, UpdateContent, Version};
use axum::body::Body;
use axum::extract::{FromRequest, Request};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, Method, Uri};
use std::sync::Arc;

/// How many of the announced patches arrived before the body ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncompletePatches {
    /// Patches parsed.
    pub received: usize,
    /// Patches announced by the `Patches` header.
    pub expected: usize,
}

/// Parsed update from a request body.
///
/// Exactly one of `body` and `patches` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedUpdate {
    /// Version ID(s) from the `Version` header.
    pub version: Vec<Version>,
    /// Parent version ID(s) from the `Parents` header.
    pub parents: Vec<Version>,
    /// Whole body, when the request carried no patches.
    pub body: Option<Bytes>,
    /// Patches in wire order.
    pub patches: Option<Vec<Patch>>,
    /// Set when the body ended early.
    pub incomplete: Option<IncompletePatches>,
}

impl ParsedUpdate {
    /// The body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// True unless the body ended before every announced patch arrived.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }

    /// Patches, with a plain body turned into one `everything` patch.
    #[must_use]
    pub fn into_patches(self) -> Vec<Patch> {
        match (self.patches, self.body) {
            (Some(patches), _) => patches,
            (None, Some(body)) => vec![Patch::new("everything", "", body)],
            (None, None) => Vec::new(),
        }
    }

    /// Convert into an [`Update`] carrying the same versions and content.
    #[must_use]
    pub fn into_update(self) -> Update {
        let content = match (self.patches, self.body) {
            (Some(patches), _) => UpdateContent::Patches(patches),
            (None, body) => UpdateContent::Body(body.unwrap_or_default()),
        };
        Update {
            version: self.version,
            parents: self.parents,
            content,
            ..Default::default()
        }
    }
}

/// Read an update from a request body.
///
/// Which of the three formats applies is decided by the `Patches` and
/// `Content-Range` headers. `Patches: 0` returns at once without reading.
///
/// # Errors
///
/// Returns [`BraidError::HeaderParse`] for malformed headers,
/// [`BraidError::BodyParse`] if the stream errors, and the scanner's errors
/// for malformed patch blocks.
pub async fn parse_update<S, E>(headers: &HeaderMap, body: S) -> Result<ParsedUpdate>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut parsed = ParsedUpdate {
        version: version_header(headers, &headers::VERSION)?,
        parents: version_header(headers, &headers::PARENTS)?,
        ..Default::default()
    };

    let patches = header_str(headers, &headers::PATCHES)?;
    let content_range = header_str(headers, &headers::CONTENT_RANGE)?;

    match (patches, content_range) {
        (None, None) => {
            parsed.body = Some(read_all(&mut body).await?);
        }
        (None, Some(range)) => {
            let range = ContentRange::from_header_value(range)?;
            let content = read_all(&mut body).await?;
            parsed.patches = Some(vec![Patch::new(range.unit, range.range, content)]);
        }
        (Some(count), _) => {
            let expected = parse_patches_count(count)?;
            let mut scanner = PatchScanner::new(expected);
            while !scanner.is_complete() {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        if scanner.feed(&chunk)? == ScanStatus::Complete {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(BraidError::BodyParse(e.to_string())),
                    None => {
                        tracing::warn!(
                            "Got an incomplete PUT: {}/{} patches were received",
                            scanner.received(),
                            expected
                        );
                        parsed.incomplete = Some(IncompletePatches {
                            received: scanner.received(),
                            expected,
                        });
                        break;
                    }
                }
            }
            parsed.patches = Some(scanner.into_patches());
        }
    }

    Ok(parsed)
}

async fn read_all<S, E>(body: &mut std::pin::Pin<&mut S>) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| BraidError::BodyParse(e.to_string()))?;
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &http::HeaderName) -> Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| BraidError::HeaderParse(format!("{} is not valid ASCII", name)))
        })
        .transpose()
}

fn version_header(headers: &HeaderMap, name: &http::HeaderName) -> Result<Vec<Version>> {
    Ok(match header_str(headers, name)? {
        Some(value) => parse_version_header(value)?,
        None => Vec::new(),
    })
}

enum BodySlot {
    Unread(Body),
    Parsed(ParsedUpdate),
    Failed,
}

/// The incoming half of a Braid exchange.
///
/// Extract it in a handler to read the Braid request headers and the body.
/// The body is read at most once: [`parse_update`](Self::parse_update) and
/// [`patches`](Self::patches) share one memoized result.
///
/// ```no_run
/// use braid_http::{BraidRequest, Result};
///
/// async fn put(req: BraidRequest) -> Result<String> {
///     let update = req.parse_update().await?;
///     Ok(format!("{} patches", update.into_patches().len()))
/// }
/// ```
#[derive(Clone)]
pub struct BraidRequest {
    state: Arc<BraidState>,
    method: Method,
    uri: Uri,
    headers: Arc<HeaderMap>,
    body: Arc<tokio::sync::Mutex<BodySlot>>,
}

impl std::fmt::Debug for BraidRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BraidRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("state", &self.state)
            .finish()
    }
}

impl BraidRequest {
    /// Build from a plain request, parsing the Braid headers.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::HeaderParse`] for malformed `Version`/`Parents`.
    pub fn from_request(req: Request) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let state = match parts.extensions.get::<Arc<BraidState>>() {
            Some(state) => state.clone(),
            None => Arc::new(BraidState::from_headers(&parts.headers)?),
        };
        Ok(BraidRequest {
            state,
            method: parts.method,
            uri: parts.uri,
            headers: Arc::new(parts.headers),
            body: Arc::new(tokio::sync::Mutex::new(BodySlot::Unread(body))),
        })
    }

    /// Braid headers of the request.
    #[inline]
    #[must_use]
    pub fn state(&self) -> &BraidState {
        &self.state
    }

    /// `Version` header, if present.
    #[inline]
    #[must_use]
    pub fn version(&self) -> Option<&[Version]> {
        self.state.version.as_deref()
    }

    /// `Parents` header, if present.
    #[inline]
    #[must_use]
    pub fn parents(&self) -> Option<&[Version]> {
        self.state.parents.as_deref()
    }

    /// `Peer` header, if present.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.state.peer.as_deref()
    }

    /// `Subscribe` header, if present.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> Option<&SubscribeMode> {
        self.state.subscribe.as_ref()
    }

    /// Request method.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI.
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// All request headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Read the update carried by the body.
    ///
    /// The body is consumed by the first call; later calls return the same
    /// result.
    ///
    /// # Errors
    ///
    /// The errors of [`parse_update`], or [`BraidError::BodyConsumed`] if an
    /// earlier call failed after consuming the body.
    pub async fn parse_update(&self) -> Result<ParsedUpdate> {
        let mut slot = self.body.lock().await;
        match std::mem::replace(&mut *slot, BodySlot::Failed) {
            BodySlot::Parsed(parsed) => {
                *slot = BodySlot::Parsed(parsed.clone());
                Ok(parsed)
            }
            BodySlot::Failed => Err(BraidError::BodyConsumed),
            BodySlot::Unread(body) => {
                let result = parse_update(&self.headers, body.into_data_stream()).await;
                if let Ok(parsed) = &result {
                    *slot = BodySlot::Parsed(parsed.clone());
                }
                result
            }
        }
    }

    /// The body as a list of patches.
    ///
    /// A plain body is returned as one patch with unit `everything` and an
    /// empty range.
    ///
    /// # Errors
    ///
    /// Same as [`parse_update`](Self::parse_update).
    pub async fn patches(&self) -> Result<Vec<Patch>> {
        Ok(self.parse_update().await?.into_patches())
    }

    /// The patches with their content decoded as JSON.
    ///
    /// # Errors
    ///
    /// Same as [`patches`](Self::patches), plus [`BraidError::Json`] for
    /// content that is not JSON.
    pub async fn patches_json(&self) -> Result<Vec<(Patch, serde_json::Value)>> {
        self.patches()
            .await?
            .into_iter()
            .map(|p| {
                let value = p.content_json()?;
                Ok((p, value))
            })
            .collect()
    }
}

impl<S: Send + Sync> FromRequest<S> for BraidRequest {
    type Rejection = BraidError;

    async fn from_request(req: Request, _state: &S) -> Result<Self> {
        BraidRequest::from_request(req)
    }
}
