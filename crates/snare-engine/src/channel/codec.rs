use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame header (big-endian body length).
const HEADER_LEN: usize = 4;

/// Default upper bound of a frame body.
const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Codec framing serializable messages over a byte stream.
///
/// Each frame is a 4-byte big-endian body length followed by the body,
/// encoded with `bincode` (standard configuration).
pub struct MessageCodec<T> {
    max_frame_len: usize,
    _marker: PhantomData<fn() -> T>,
}

/// Error returned by [MessageCodec].
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// I/O error of the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),

    /// Frame body exceeds the configured limit.
    #[error("frame of {0} bytes exceeds the limit of {1} bytes")]
    FrameTooLarge(usize, usize),
}

impl<T> MessageCodec<T> {
    /// Creates a new codec.
    pub const fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Creates a new codec rejecting frame bodies larger than `max_frame_len`.
    pub const fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serde::encode_to_vec(&item, bincode::config::standard())?;

        let len = u32::try_from(body.len())
            .ok()
            .filter(|&len| len as usize <= self.max_frame_len)
            .ok_or(CodecError::FrameTooLarge(body.len(), self.max_frame_len))?;

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);

        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };

        let mut len_bytes = [0u8; HEADER_LEN];
        len_bytes.copy_from_slice(header);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge(len, self.max_frame_len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);

        let (item, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())?;

        Ok(Some(item))
    }
}
