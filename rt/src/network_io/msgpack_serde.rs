// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! This module provides msgpack serialization helpers for the wire protocol.
//!
//! It wraps [`rmp_serde`] to provide a consistent interface for serializing and
//! deserializing data structures to/from bytes for network transmission. The
//! "named" encoding is used so that records travel as field-keyed maps (and
//! enum payloads as variant-keyed maps), which keeps every frame
//! self-describing. Byte strings encode as msgpack `bin`, distinct from UTF-8
//! `str`.

use serde::{Deserialize, Serialize};

use crate::{Buffer, BufferAtom};

/// Errors from the payload codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode msgpack payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode msgpack payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serialize the payload to msgpack bytes. Returns a [Buffer]. `T` must
/// implement the [Serialize] trait.
///
/// # Errors
///
/// Returns an error if the data cannot be represented in msgpack (e.g. a map
/// key that is not serializable).
pub fn try_serialize<T: Serialize>(data: &T) -> Result<Buffer, CodecError> {
    Ok(rmp_serde::to_vec_named(data)?)
}

/// Deserialize a msgpack byte buffer into type `T`. Returns a
/// [`Result`] of `T`.
///
/// # Errors
///
/// Returns an error if:
/// - The buffer contains invalid msgpack data
/// - The data cannot be deserialized into type `T`
/// - The buffer is corrupted or incomplete
pub fn try_deserialize<T: for<'de> Deserialize<'de>>(
    buffer: &[BufferAtom],
) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(buffer)?)
}

#[cfg(test)]
mod tests_msgpack_serde {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use crate::{Buffer, msgpack_serde};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestPayload {
        pub id: f32,
        pub description: String,
        pub data: serde_bytes::ByteBuf,
    }

    #[test]
    fn test_msgpack_serde() {
        let value = TestPayload {
            id: 12.0,
            description: "foo bar".to_string(),
            data: serde_bytes::ByteBuf::from(vec![0, 1, 2]),
        };

        // Struct -> Bytes (Buffer).
        let struct_to_bytes: Buffer = msgpack_serde::try_serialize(&value).unwrap();

        // Bytes (Buffer) -> Struct.
        let struct_from_bytes: TestPayload =
            msgpack_serde::try_deserialize(&struct_to_bytes).unwrap();

        assert_eq!(value, struct_from_bytes);
    }

    #[test]
    fn test_byte_strings_are_not_text() {
        // msgpack must keep `bin` distinguishable from `str`: a byte buffer
        // round-trips as bytes, never as a UTF-8 string.
        let value = TestPayload {
            id: 0.0,
            description: "text".into(),
            data: serde_bytes::ByteBuf::from(vec![0xff, 0xfe]),
        };
        let bytes = msgpack_serde::try_serialize(&value).unwrap();
        let back: TestPayload = msgpack_serde::try_deserialize(&bytes).unwrap();
        assert_eq!(back.data.as_ref(), &[0xff, 0xfe]);
    }

    #[test]
    fn test_option_none_is_nil() {
        // `Option::<T>::None` must encode as msgpack nil - this is the
        // message-loop terminate sentinel on the wire.
        let bytes = msgpack_serde::try_serialize(&Option::<TestPayload>::None).unwrap();
        assert_eq!(bytes, vec![0xc0]);
        let back: Option<TestPayload> = msgpack_serde::try_deserialize(&bytes).unwrap();
        assert!(back.is_none());
    }
}
