//! MessagePack encoding for the Fluentd forward protocol.
//!
//! Events become `[tag, time, record]` arrays; batches become
//! `[tag, [[time, record], ...]]`. The connection manager additionally sends
//! an options map as the fourth element. Records are any `serde::Serialize`
//! value and are written with struct fields as map keys.

mod decoder;
mod event_time;


use rmp_serde::Serializer;
use serde::Serialize;
use thiserror::Error;

pub use decoder::{Decoder, Message, map_get};
pub use event_time::{EVENT_TIME_EXT_CODE, EventTime, Timestamp};

/// Errors raised while encoding or decoding forward protocol messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmpv::decode::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Options map sent as the fourth element of forward-mode messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ForwardOptions {
    /// Number of events carried by the message.
    pub size: usize,
    /// Chunk id the collector echoes back in its `ack` response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
}

fn to_msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(128);
    value.serialize(&mut Serializer::new(&mut buf).with_struct_map())?;
    Ok(buf)
}

/// Encode a single event as `[tag, time, record]`.
pub fn encode<T: Serialize + ?Sized>(
    tag: &str,
    time: &Timestamp,
    record: &T,
) -> Result<Vec<u8>, CodecError> {
    to_msgpack(&(tag, time, record))
}

/// Encode several events sharing one tag as `[tag, [[time, record], ...]]`.
pub fn encode_batch<T: Serialize>(
    tag: &str,
    entries: &[(Timestamp, T)],
) -> Result<Vec<u8>, CodecError> {
    to_msgpack(&(tag, entries))
}

/// Encode a single event with an options map as `[tag, time, record, options]`.
pub fn encode_forward<T: Serialize + ?Sized>(
    tag: &str,
    time: &Timestamp,
    record: &T,
    options: &ForwardOptions,
) -> Result<Vec<u8>, CodecError> {
    to_msgpack(&(tag, time, record, options))
}

/// Encode a batch with an options map as `[tag, [[time, record], ...], options]`.
pub fn encode_batch_forward<T: Serialize>(
    tag: &str,
    entries: &[(Timestamp, T)],
    options: &ForwardOptions,
) -> Result<Vec<u8>, CodecError> {
    to_msgpack(&(tag, entries, options))
}
