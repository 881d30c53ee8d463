//! Braid HTTP server implementation.
//!
//! This module provides server-side support for the Braid protocol using Axum.
//! It enables applications to:
//!
//! - **Read updates** sent as a body, one patch, or a `Patches: N` list
//! - **Send updates** on one-shot responses and subscriptions (HTTP 209)
//! - **Keep subscriptions alive** with heartbeats
//! - **Multiplex** many responses over one connection
//!
//! # Module Organization
//!
//! ```text
//! server/
//! ├── middleware     - braidify, BraidLayer and BraidState
//! ├── parse_update   - BraidRequest and the body read path
//! ├── response       - BraidResponse and its sinks
//! ├── send_update    - BraidResponse::send_update
//! ├── subscription   - BraidResponse::start_subscription and heartbeats
//! ├── multiplex      - multiplexer endpoints, registry and forwarding
//! ├── subscriptions  - live subscriptions by (peer, url)
//! ├── store          - cookie-scoped subscription store
//! └── config         - ServerConfig options
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BraidLayer`] | Axum middleware layer |
//! | [`BraidRequest`] | Extractor for the incoming half |
//! | [`BraidResponse`] | Extractor for the outgoing half |
//! | [`BraidState`] | Parsed Braid request headers |
//! | [`ServerConfig`] | Server configuration options |
//!
//! # Examples
//!
//! ## Creating a BraidLayer
//!
//! ```
//! use braid_http::{BraidLayer, ServerConfig};
//!
//! // Default configuration
//! let layer = BraidLayer::new();
//!
//! // Custom configuration
//! let config = ServerConfig {
//!     enable_multiplex: false,
//!     ..Default::default()
//! };
//! let layer = BraidLayer::with_config(config);
//! ```
//!
//! ## Serving a subscription
//!
//! ```no_run
//! use braid_http::{BraidRequest, BraidResponse, Result, SubscriptionOptions, Update, Version};
//!
//! async fn get(req: BraidRequest, res: BraidResponse) -> Result<()> {
//!     if req.subscribe().is_some() {
//!         res.start_subscription(SubscriptionOptions::new().on_close(|| {
//!             tracing::info!("client left");
//!         }))?;
//!     }
//!     res.send_update(&Update::snapshot(Version::new("v1"), "hello"))
//! }
//! ```
//!
//! # HTTP Status Codes
//!
//! | Code | Description |
//! |------|-------------|
//! | 209 | Subscription accepted, updates follow |
//! | 293 | Response sent through a multiplexer |
//! | 409 | Multiplexer or request id already in use |
//! | 424 | `Multiplex-Through` names an unknown multiplexer |

mod config;
mod middleware;
mod multiplex;
mod parse_update;
mod response;
mod send_update;
mod store;
mod subscription;
mod subscriptions;


pub use config::ServerConfig;
pub use middleware::{braidify, BraidLayer, BraidState, IsFirefox};
pub use multiplex::{Multiplexer, MultiplexerRegistry};
pub use parse_update::{parse_update, BraidRequest, IncompletePatches, ParsedUpdate};
pub use response::{BraidResponse, ConnectionEvent, ResponseHead};
pub use store::{MemorySubscriptionStore, SubscriptionStore};
pub use subscription::SubscriptionOptions;
pub use subscriptions::SubscriptionRegistry;
