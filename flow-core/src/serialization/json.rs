use super::FiberSerializer;
use crate::codec::{Decoder, Encoder, sealed};
use crate::fiber::FiberImage;
use anyhow::{Result, bail};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON codec for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {}
impl Decoder for JsonCodec {}

impl<T> sealed::EncodeValue<T> for JsonCodec
where
    T: Serialize,
{
    fn encode_value(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl<T> sealed::DecodeValue<T> for JsonCodec
where
    T: DeserializeOwned,
{
    fn decode_value(&self, bytes: Bytes) -> Result<T> {
        Ok(serde_json::from_slice(&bytes)?)
    }
}

const FIBER_MAGIC: &[u8] = b"FIBER/1\n";

/// Writes fiber images as JSON behind a short magic header.
///
/// The header lets [`deserialize`](FiberSerializer::deserialize) reject blobs
/// that are valid JSON but were never a fiber, such as a flow result stored
/// under the wrong column.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFiberSerializer;

impl FiberSerializer for JsonFiberSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, image: &FiberImage) -> Result<Vec<u8>> {
        let mut out = FIBER_MAGIC.to_vec();
        serde_json::to_writer(&mut out, image)?;
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<FiberImage> {
        let Some(body) = bytes.strip_prefix(FIBER_MAGIC) else {
            bail!("payload is not a serialized fiber");
        };
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::SuspensionKind;
    use crate::primitives::FlowId;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        to: String,
        times: u8,
    }

    #[test]
    fn test_json_codec_struct() {
        let codec = JsonCodec;
        let value = Greeting {
            to: "bob".into(),
            times: 2,
        };
        let bytes = codec.encode(&value).unwrap();
        let back: Greeting = codec.decode(bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_json_codec_type_mismatch() {
        let bytes = JsonCodec.encode(&"text").unwrap();
        let result: Result<Greeting> = JsonCodec.decode(bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_fiber_serializer_rejects_foreign_payload() {
        let serializer = JsonFiberSerializer;
        let err = serializer.deserialize(b"{\"flow_name\":\"x\"}").unwrap_err();
        assert!(err.to_string().contains("not a serialized fiber"));
    }

    #[test]
    fn test_fiber_serializer_image() {
        let serializer = JsonFiberSerializer;
        let image = FiberImage {
            flow_id: FlowId::new(),
            flow_name: "ping".into(),
            suspended_on: SuspensionKind::Messages,
            state: b"{\"round\":1}".to_vec(),
        };
        let bytes = serializer.serialize(&image).unwrap();
        assert!(bytes.starts_with(FIBER_MAGIC));
        let back = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, image);
    }
}
