//! Streaming decoder for forward protocol traffic.
//!
//! Used by the connection manager to read handshake and acknowledgement
//! messages and by tests to inspect what a collector received.

use std::io::{self, Cursor};

use rmpv::Value;

use super::{CodecError, Timestamp};

/// Accumulates bytes and yields complete MessagePack values.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete value, or `None` when more bytes are needed.
    ///
    /// Malformed input discards the buffer so a corrupt stream cannot wedge
    /// the decoder.
    pub fn next_value(&mut self) -> Result<Option<Value>, CodecError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(self.buf.as_slice());
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let used = usize::try_from(cursor.position()).unwrap_or(self.buf.len());
                self.buf.drain(..used);
                Ok(Some(value))
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => {
                self.buf.clear();
                Err(err.into())
            }
        }
    }

    /// Decode every complete value currently buffered.
    pub fn drain_values(&mut self) -> Result<Vec<Value>, CodecError> {
        let mut values = Vec::new();
        while let Some(value) = self.next_value()? {
            values.push(value);
        }
        Ok(values)
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io_err)
        | rmpv::decode::Error::InvalidDataRead(io_err) => {
            io_err.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// One event as seen by the collector.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub tag: String,
    pub time: Timestamp,
    pub record: Value,
    /// Forward-mode options map, when present.
    pub options: Option<Value>,
}

impl Message {
    /// Expand a decoded value into its events.
    ///
    /// Accepts `[tag, time, record]`, `[tag, time, record, options]` and the
    /// batched `[tag, [[time, record], ...]]` form (with optional options).
    pub fn from_value(value: Value) -> Result<Vec<Message>, CodecError> {
        let Value::Array(items) = value else {
            return Err(malformed("message is not an array"));
        };
        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(Value::String(tag)) => tag
                .into_str()
                .ok_or_else(|| malformed("tag is not valid UTF-8"))?,
            _ => return Err(malformed("missing tag")),
        };
        match items.next() {
            Some(Value::Array(entries)) => {
                let options = items.next();
                entries
                    .into_iter()
                    .map(|entry| {
                        let Value::Array(pair) = entry else {
                            return Err(malformed("batch entry is not an array"));
                        };
                        let mut pair = pair.into_iter();
                        let time = pair.next().as_ref().and_then(Timestamp::from_value);
                        let record = pair.next();
                        match (time, record) {
                            (Some(time), Some(record)) => Ok(Message {
                                tag: tag.clone(),
                                time,
                                record,
                                options: options.clone(),
                            }),
                            _ => Err(malformed("batch entry needs time and record")),
                        }
                    })
                    .collect()
            }
            Some(time_value) => {
                let time =
                    Timestamp::from_value(&time_value).ok_or_else(|| malformed("bad timestamp"))?;
                let record = items.next().ok_or_else(|| malformed("missing record"))?;
                Ok(vec![Message {
                    tag,
                    time,
                    record,
                    options: items.next(),
                }])
            }
            None => Err(malformed("missing timestamp")),
        }
    }

    /// Look up a string key in the record map.
    pub fn field(&self, key: &str) -> Option<&Value> {
        map_get(&self.record, key)
    }
}

/// Look up a string key in a MessagePack map.
pub fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn malformed(reason: &str) -> CodecError {
    CodecError::Malformed(reason.to_string())
}
