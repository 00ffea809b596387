//! Serialization formats for flow values and suspended fibers.

mod json;

pub use json::{JsonCodec, JsonFiberSerializer};

use crate::fiber::FiberImage;
use anyhow::Result;

/// Turns a suspended fiber into a continuation blob and back.
///
/// Each execution context owns one serializer. Only the serializer that
/// produced a continuation is expected to read it, so implementations should
/// refuse payloads that were not written by them.
pub trait FiberSerializer: Send + Sync {
    /// Short name of the wire format, used in log fields.
    fn format(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns an error if the image cannot be encoded.
    fn serialize(&self, image: &FiberImage) -> Result<Vec<u8>>;

    /// # Errors
    ///
    /// Returns an error if `bytes` is not a fiber written by this serializer.
    fn deserialize(&self, bytes: &[u8]) -> Result<FiberImage>;
}
