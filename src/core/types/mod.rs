//! Core data types for the Braid-HTTP protocol.
//!
//! # Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Version`] | Opaque identifier for a point in resource history |
//! | [`Patch`] | Replacement content for one range of a resource |
//! | [`ContentRange`] | Unit and range of a patch |
//! | [`Update`] | Version metadata plus a body or a list of patches |
//! | [`SubscribeMode`] | Parsed `Subscribe` request header |
//!
//! ```
//! use braid_http::{Patch, Update, Version};
//!
//! let update = Update::patches(vec![
//!     Patch::json(".a", "1"),
//!     Patch::json(".b", "22"),
//! ])
//! .with_version(Version::new("v3"))
//! .with_parent(Version::new("v2"));
//!
//! assert!(update.validate().is_ok());
//! ```

mod content_range;
mod patch;
mod subscribe;
mod update;
mod version;

pub use content_range::ContentRange;
pub use patch::Patch;
pub use subscribe::SubscribeMode;
pub use update::{Update, UpdateContent};
pub use version::Version;
