//! Turning `(label, time, record)` into forward protocol bytes.

use log::{debug, warn};
use serde::Serialize;

use crate::{
    codec::{self, CodecError, Decoder, ForwardOptions, Message, Timestamp},
    error::SenderError,
    last_error::LastErrorSlot,
};

use super::config::SenderConfig;

/// Record sent in place of one that could not be encoded.
#[derive(Serialize)]
struct EncodeFailure<'a> {
    level: &'static str,
    message: &'static str,
    traceback: &'a str,
}

/// Builds packets in the caller's thread for both sender kinds.
#[derive(Clone, Debug)]
pub(crate) struct PacketBuilder {
    base_tag: String,
    nanosecond_precision: bool,
    forward_packet_error: bool,
    verbose: bool,
}

impl PacketBuilder {
    pub fn new(base_tag: impl Into<String>, nanosecond_precision: bool) -> Self {
        Self {
            base_tag: base_tag.into(),
            nanosecond_precision,
            forward_packet_error: true,
            verbose: false,
        }
    }

    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            forward_packet_error: config.forward_packet_error,
            verbose: config.verbose,
            ..Self::new(config.tag.clone(), config.nanosecond_precision)
        }
    }

    /// Join the base tag and `label` with a dot, omitting empty parts.
    pub fn tag(&self, label: &str) -> String {
        match (self.base_tag.is_empty(), label.is_empty()) {
            (_, true) => self.base_tag.clone(),
            (true, false) => label.to_owned(),
            (false, false) => format!("{}.{label}", self.base_tag),
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::now(self.nanosecond_precision)
    }

    /// Encode a single event, substituting a failure record when `data`
    /// cannot be serialised and forwarding is enabled.
    pub fn event<T: Serialize + ?Sized>(
        &self,
        label: &str,
        time: Timestamp,
        data: &T,
        errors: &LastErrorSlot,
    ) -> Result<Vec<u8>, SenderError> {
        self.event_with_options(label, time, data, None, errors)
    }

    /// As [`event`](Self::event), appending a forward-mode options map when
    /// `options` is given.
    pub fn event_with_options<T: Serialize + ?Sized>(
        &self,
        label: &str,
        time: Timestamp,
        data: &T,
        options: Option<&ForwardOptions>,
        errors: &LastErrorSlot,
    ) -> Result<Vec<u8>, SenderError> {
        let tag = self.tag(label);
        let time = time.resolve(self.nanosecond_precision);
        let bytes = match encode_one(&tag, &time, data, options) {
            Ok(bytes) => bytes,
            Err(source) => self.substitute(tag.as_str(), source, errors, |text| {
                encode_one(&tag, &time, &failure_record(text), options)
            })?,
        };
        self.trace(&bytes);
        Ok(bytes)
    }

    /// Encode several events sharing one tag as a single packet.
    pub fn batch<T: Serialize>(
        &self,
        label: &str,
        entries: &[(Timestamp, T)],
        errors: &LastErrorSlot,
    ) -> Result<Vec<u8>, SenderError> {
        self.batch_with_options(label, entries, None, errors)
    }

    /// As [`batch`](Self::batch), with an optional options map.
    pub fn batch_with_options<T: Serialize>(
        &self,
        label: &str,
        entries: &[(Timestamp, T)],
        options: Option<&ForwardOptions>,
        errors: &LastErrorSlot,
    ) -> Result<Vec<u8>, SenderError> {
        let tag = self.tag(label);
        let resolved: Vec<(Timestamp, &T)> = entries
            .iter()
            .map(|(time, record)| (time.resolve(self.nanosecond_precision), record))
            .collect();
        let encoded = match options {
            Some(options) => codec::encode_batch_forward(&tag, &resolved, options),
            None => codec::encode_batch(&tag, &resolved),
        };
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(source) => self.substitute(tag.as_str(), source, errors, |text| {
                let time = resolved.first().map_or_else(|| self.now(), |(time, _)| *time);
                encode_one(&tag, &time, &failure_record(text), options)
            })?,
        };
        self.trace(&bytes);
        Ok(bytes)
    }

    fn substitute(
        &self,
        tag: &str,
        source: CodecError,
        errors: &LastErrorSlot,
        encode_failure: impl FnOnce(&str) -> Result<Vec<u8>, CodecError>,
    ) -> Result<Vec<u8>, SenderError> {
        let err = SenderError::Encoding {
            tag: tag.to_owned(),
            source,
        };
        if !self.forward_packet_error {
            return Err(err);
        }
        let text = err.to_string();
        warn!("femtofluent: {text}; sending failure record instead");
        errors.set(err);
        encode_failure(&text).map_err(|source| SenderError::Encoding {
            tag: tag.to_owned(),
            source,
        })
    }

    fn trace(&self, bytes: &[u8]) {
        if !self.verbose {
            return;
        }
        let mut decoder = Decoder::new();
        decoder.feed(bytes);
        let messages = decoder
            .drain_values()
            .and_then(|values| -> Result<Vec<Message>, CodecError> {
                let mut out = Vec::new();
                for value in values {
                    out.extend(Message::from_value(value)?);
                }
                Ok(out)
            });
        match messages {
            Ok(messages) => {
                for msg in messages {
                    debug!("femtofluent: {} {:?} {}", msg.tag, msg.time, msg.record);
                }
            }
            Err(err) => debug!("femtofluent: packet not decodable for tracing: {err}"),
        }
    }
}

fn encode_one<T: Serialize + ?Sized>(
    tag: &str,
    time: &Timestamp,
    record: &T,
    options: Option<&ForwardOptions>,
) -> Result<Vec<u8>, CodecError> {
    match options {
        Some(options) => codec::encode_forward(tag, time, record, options),
        None => codec::encode(tag, time, record),
    }
}

fn failure_record(traceback: &str) -> EncodeFailure<'_> {
    EncodeFailure {
        level: "CRITICAL",
        message: "Can't output to log",
        traceback,
    }
}
