//! Braid-HTTP protocol implementation.
//!
//! # Modules
//!
//! - [`types`] - Version, Patch, ContentRange, Update and SubscribeMode
//! - [`protocol`] - Header codecs, patch framing and multiplex framing
//! - [`server`] - Axum middleware, subscriptions and the multiplexer
//! - [`error`] - `BraidError` and the crate `Result`

pub mod error;
pub mod protocol;
#[cfg(feature = "server")]
pub mod server;
pub mod types;

pub use error::{BraidError, Result};
pub use types::{ContentRange, Patch, SubscribeMode, Update, UpdateContent, Version};
