//! Codec traits used to move flow arguments, state and payloads in and out of bytes.
//!
//! A codec is chosen per registered flow. The engine itself only ever sees
//! [`Bytes`]; the typed side of the conversion lives in the registry wrappers.
//! Errors from [`Encoder::encode`] and [`Decoder::decode`] name the Rust type
//! involved, so a failed resume points at the flow state or message that
//! did not fit.

use anyhow::{Context, Result};
use bytes::Bytes;

/// Per-type encode/decode hooks.
///
/// A codec implements [`Encoder`]/[`Decoder`] once (usually with an empty
/// impl) and then implements these helpers with whatever bounds its format
/// needs, e.g. `T: serde::Serialize`.
pub mod sealed {
    use super::*;

    /// Encode a single value type.
    pub trait EncodeValue<T>: Send + 'static {
        fn encode_value(&self, value: &T) -> Result<Bytes>;
    }

    /// Decode a single value type.
    pub trait DecodeValue<T>: Send + 'static {
        fn decode_value(&self, bytes: Bytes) -> Result<T>;
    }
}

/// Turns typed values into bytes.
pub trait Encoder: Send + 'static {
    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        Self: sealed::EncodeValue<T>,
    {
        sealed::EncodeValue::encode_value(self, value)
            .with_context(|| format!("encoding {}", std::any::type_name::<T>()))
    }
}

/// Turns bytes back into typed values.
pub trait Decoder: Send + 'static {
    fn decode<T>(&self, bytes: Bytes) -> Result<T>
    where
        Self: sealed::DecodeValue<T>,
    {
        let len = bytes.len();
        sealed::DecodeValue::decode_value(self, bytes)
            .with_context(|| format!("decoding {} from {len} bytes", std::any::type_name::<T>()))
    }
}

/// Both directions at once. Implemented for every `Encoder + Decoder`.
pub trait Codec: Encoder + Decoder + Send + 'static {}

impl<U> Codec for U where U: Encoder + Decoder + Send + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes `u32` as four big-endian bytes and nothing else.
    struct FixedWidth;

    impl Encoder for FixedWidth {}
    impl Decoder for FixedWidth {}

    impl sealed::EncodeValue<u32> for FixedWidth {
        fn encode_value(&self, value: &u32) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(&value.to_be_bytes()))
        }
    }

    impl sealed::DecodeValue<u32> for FixedWidth {
        fn decode_value(&self, bytes: Bytes) -> Result<u32> {
            let raw: [u8; 4] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("expected 4 bytes, got {}", bytes.len()))?;
            Ok(u32::from_be_bytes(raw))
        }
    }

    fn assert_codec<C: Codec>(_: &C) {}

    #[test]
    fn test_custom_bounds_codec() {
        let codec = FixedWidth;
        assert_codec(&codec);
        let bytes = codec.encode(&7u32).unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 7]);
        let back: u32 = codec.decode(bytes).unwrap();
        assert_eq!(back, 7);
    }

    #[test]
    fn test_decode_error_names_type() {
        let err = FixedWidth.decode::<u32>(Bytes::from_static(b"xy")).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("decoding u32 from 2 bytes"), "{message}");
        assert!(message.contains("expected 4 bytes, got 2"), "{message}");
    }
}
