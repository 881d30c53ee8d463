//! The unit of change pushed with `send_update`.
//!
//! An [`Update`] carries optional version metadata and exactly one of a
//! plain body or a non-empty list of patches. The choice is made by
//! [`UpdateContent`] at construction time, so a body and patches can never
//! be present together.
//!
//! ```
//! use braid_http::{Patch, Update, Version};
//!
//! let snapshot = Update::body(r#"[{"text":"hi"}]"#)
//!     .with_version(Version::new("v2"))
//!     .with_parent(Version::new("v1"));
//! assert!(snapshot.is_body());
//!
//! let patched = Update::patch(Patch::json(".age", "31"));
//! assert_eq!(patched.patch_list().map(<[Patch]>::len), Some(1));
//! ```

use super::{Patch, Version};
use crate::core::error::{BraidError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Content of an update: a plain body or an ordered list of patches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateContent {
    /// Opaque byte payload. May be empty.
    Body(Bytes),
    /// Ordered patches, applied in order.
    Patches(Vec<Patch>),
}

impl Default for UpdateContent {
    fn default() -> Self {
        UpdateContent::Body(Bytes::new())
    }
}

/// A single update sent to a client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Update {
    /// Version IDs of this update. Empty means no `Version` header.
    pub version: Vec<Version>,
    /// Versions this update supersedes. Empty means no `Parents` header.
    pub parents: Vec<Version>,
    /// Body or patches.
    pub content: UpdateContent,
    /// Status code. `None` means 200.
    pub status: Option<u16>,
    /// Extra header lines sent with the update.
    pub extra_headers: BTreeMap<String, String>,
}

impl Update {
    /// An update whose content is a plain body.
    #[must_use]
    pub fn body(body: impl Into<Bytes>) -> Self {
        Update {
            content: UpdateContent::Body(body.into()),
            ..Default::default()
        }
    }

    /// A versioned snapshot.
    #[must_use]
    pub fn snapshot(version: Version, body: impl Into<Bytes>) -> Self {
        Self::body(body).with_version(version)
    }

    /// An update carrying exactly one patch.
    ///
    /// On the wire this is written without a `Patches` header.
    #[must_use]
    pub fn patch(patch: Patch) -> Self {
        Self::patches(vec![patch])
    }

    /// An update carrying a list of patches.
    ///
    /// The list must be non-empty; [`Update::validate`] rejects an empty one.
    #[must_use]
    pub fn patches(patches: Vec<Patch>) -> Self {
        Update {
            content: UpdateContent::Patches(patches),
            ..Default::default()
        }
    }

    /// An update with an empty body.
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a version ID.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version.push(version);
        self
    }

    /// Append a parent version ID.
    #[must_use]
    pub fn with_parent(mut self, parent: Version) -> Self {
        self.parents.push(parent);
        self
    }

    /// Set the status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Add an extra header line.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// True if the content is a plain body.
    #[inline]
    #[must_use]
    pub fn is_body(&self) -> bool {
        matches!(self.content, UpdateContent::Body(_))
    }

    /// The body, if this is a body update.
    #[must_use]
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.content {
            UpdateContent::Body(b) => Some(b),
            UpdateContent::Patches(_) => None,
        }
    }

    /// The patches, if this is a patch update.
    #[must_use]
    pub fn patch_list(&self) -> Option<&[Patch]> {
        match &self.content {
            UpdateContent::Patches(p) => Some(p),
            UpdateContent::Body(_) => None,
        }
    }

    /// Effective status code.
    #[inline]
    #[must_use]
    pub fn status_or_default(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    /// Check the update before any byte is written.
    ///
    /// # Errors
    ///
    /// Returns [`BraidError::Usage`] if the status is outside `(100, 600)`
    /// or the patch list is empty.
    pub fn validate(&self) -> Result<()> {
        if let Some(status) = self.status {
            if status <= 100 || status >= 600 {
                return Err(BraidError::Usage(format!(
                    "status must be between 100 and 600, got {}",
                    status
                )));
            }
        }
        if let UpdateContent::Patches(p) = &self.content {
            if p.is_empty() {
                return Err(BraidError::Usage("an update needs at least one patch".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty_body() {
        let update = Update::empty();
        assert_eq!(update.body_bytes(), Some(&Bytes::new()));
        assert_eq!(update.status_or_default(), 200);
        assert!(update.validate().is_ok());
    }

    #[test]
    fn test_single_patch_is_one_element_list() {
        let update = Update::patch(Patch::json(".a", "1"));
        assert!(!update.is_body());
        assert_eq!(update.patch_list().unwrap().len(), 1);
        assert!(update.body_bytes().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_status() {
        assert!(Update::body("x").with_status(100).validate().is_err());
        assert!(Update::body("x").with_status(600).validate().is_err());
        assert!(Update::body("x").with_status(101).validate().is_ok());
        assert!(Update::body("x").with_status(599).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_patches() {
        let err = Update::patches(vec![]).validate().unwrap_err();
        assert!(matches!(err, BraidError::Usage(_)));
    }

    #[test]
    fn test_builder_accumulates_versions() {
        let update = Update::snapshot(Version::new("v2"), "x")
            .with_parent(Version::new("v1a"))
            .with_parent(Version::new("v1b"));
        assert_eq!(update.version, vec![Version::new("v2")]);
        assert_eq!(update.parents.len(), 2);
    }
}
