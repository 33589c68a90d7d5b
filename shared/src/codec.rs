//! Binary encoding of [`Message`] values.
//!
//! Messages are encoded with bincode using variable-length integers and a
//! hard size limit, so a hostile length prefix cannot make the decoder
//! allocate more than one datagram's worth of memory.

use crate::protocol::Message;
use bincode::Options;
use thiserror::Error;

/// Largest encoded message accepted by [`decode`].
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to decode message ({len} bytes): {source}")]
    Decode {
        len: usize,
        #[source]
        source: bincode::Error,
    },
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    options()
        .serialize(message)
        .map_err(|source| CodecError::Encode {
            kind: message.kind(),
            source,
        })
}

/// Decodes one message. Trailing bytes after a complete message are an
/// error.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    options()
        .deserialize(bytes)
        .map_err(|source| CodecError::Decode {
            len: bytes.len(),
            source,
        })
}
