//! braid_http: Braid-HTTP server engine in Rust.
//!
//! This crate turns an axum application into a Braid-HTTP server:
//!
//! - **protocol**: the patch codec (`Patches: N` framing), header codecs and
//!   multiplexer stream framing.
//! - **server**: the `braidify` middleware, the augmented request/response
//!   pair, subscriptions with heartbeats, and the connection multiplexer.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use braid_http::{BraidLayer, BraidResponse, Update, Version};
//!
//! async fn handler(res: BraidResponse) -> braid_http::Result<()> {
//!     res.send_update(&Update::body("hello").with_version(Version::new("v1")))
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let app = Router::new()
//!     .route("/doc", get(handler))
//!     .layer(BraidLayer::new().middleware());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8888").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Top-level re-exports for common usage
pub use crate::core::error::{BraidError, Result};
pub use crate::core::protocol;
pub use crate::core::types;
pub use crate::core::types::{ContentRange, Patch, SubscribeMode, Update, UpdateContent, Version};

#[cfg(feature = "server")]
pub use crate::core::server;
#[cfg(feature = "server")]
pub use crate::core::server::{
    braidify, BraidLayer, BraidRequest, BraidResponse, BraidState, IsFirefox, ParsedUpdate,
    ServerConfig, SubscriptionOptions,
};
