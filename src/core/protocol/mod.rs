//! Braid-HTTP wire protocol.
//!
//! Everything here is transport-agnostic: pure functions over byte buffers
//! and header strings, usable without the `server` feature.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`constants`] | Header names, status codes, multiplex version |
//! | `headers` | `Version`/`Parents`/`Heartbeats`/`Subscribe` codecs |
//! | `formatter` | Patch blocks and subscription update framing |
//! | `scanner` | Incremental `Patches: N` body parser |
//! | `multiplex` | Multiplexer stream framing |

pub mod constants;
mod formatter;
mod headers;
mod multiplex;
mod scanner;

pub use formatter::{
    ascii_ify, encode_patches, format_subscription_update, reason_phrase, write_header,
    write_patch, write_patch_blocks, write_patches,
};
pub use headers::{
    format_version_header, parse_heartbeat, parse_patches_count, parse_subscribe,
    parse_version_header,
};
pub use multiplex::{MultiplexEvent, MultiplexParser};
pub use scanner::{PatchScanner, ScanStatus};
