//! MessagePack codec for the packet envelope, plus the stream framing the
//! transport uses to delimit one record per message.
//!
//! A packet is one self-describing map with exactly one top-level key (the
//! kind tag) whose value is the flat payload map: `from_pid` (16 raw bytes),
//! `to_pid` (raw bytes, an array of raw bytes, or omitted for a local
//! destination), `exclude_sender` (bool) and the kind-specific fields. The
//! envelope field names are reserved; body fields using them are not carried.

use std::sync::Arc;

use rmpv::Value;

use crate::packet::{Packet, PacketBody};
use crate::pid::{PeerId, Recipients};
use crate::registry::PacketRegistry;

const FROM_PID: &str = "from_pid";
const TO_PID: &str = "to_pid";
const EXCLUDE_SENDER: &str = "exclude_sender";

/// Errors produced while encoding or decoding packet records. Both classes
/// are recoverable at the caller; a bad record never takes a connection down.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unknown packet kind: {0}")]
    Unknown(String),
}

/// Encodes a packet into one self-describing record.
pub fn encode(registry: &PacketRegistry, packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let mut body = match packet.body_value()? {
        Value::Map(entries) => entries,
        other => {
            return Err(CodecError::Malformed(format!(
                "kind '{}' body must encode to a map, got {other}",
                registry.name(packet.kind()),
            )));
        }
    };
    body.retain(|(key, _)| {
        !matches!(key.as_str(), Some(FROM_PID | TO_PID | EXCLUDE_SENDER))
    });

    let mut payload = Vec::with_capacity(body.len() + 3);
    payload.push((
        Value::from(FROM_PID),
        Value::Binary(packet.from_pid.as_bytes().to_vec()),
    ));
    match &packet.to_pid {
        Recipients::Local => {}
        Recipients::One(pid) => {
            payload.push((Value::from(TO_PID), Value::Binary(pid.as_bytes().to_vec())));
        }
        Recipients::Many(pids) => {
            let items = pids
                .iter()
                .map(|pid| Value::Binary(pid.as_bytes().to_vec()))
                .collect();
            payload.push((Value::from(TO_PID), Value::Array(items)));
        }
    }
    payload.push((
        Value::from(EXCLUDE_SENDER),
        Value::Boolean(packet.exclude_sender),
    ));
    payload.append(&mut body);

    let record = Value::Map(vec![(
        Value::from(registry.name(packet.kind())),
        Value::Map(payload),
    )]);

    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &record)
        .map_err(|e| CodecError::Malformed(format!("record write failed: {e}")))?;
    Ok(bytes)
}

/// Decodes one record into a typed packet using the registered kinds.
pub fn decode(registry: &PacketRegistry, bytes: &[u8]) -> Result<Packet, CodecError> {
    let mut cursor = bytes;
    let record = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| CodecError::Malformed(format!("unreadable record: {e}")))?;
    if !cursor.is_empty() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after record",
            cursor.len()
        )));
    }

    let Value::Map(mut outer) = record else {
        return Err(CodecError::Malformed("record is not a map".into()));
    };
    if outer.is_empty() {
        return Err(CodecError::Malformed("empty record".into()));
    }

    let (tag, payload) = outer.swap_remove(0);
    let Some(tag) = tag.as_str() else {
        return Err(CodecError::Malformed(format!(
            "kind tag is not a string: {tag}"
        )));
    };
    let kind = registry
        .lookup(tag)
        .ok_or_else(|| CodecError::Unknown(tag.to_string()))?;

    let Value::Map(mut fields) = payload else {
        return Err(CodecError::Malformed(format!(
            "payload of '{tag}' is not a map"
        )));
    };

    let from_pid = take_field(&mut fields, FROM_PID)
        .ok_or_else(|| CodecError::Malformed(format!("'{tag}' is missing {FROM_PID}")))?;
    let from_pid = peer_id_from_value(&from_pid)?;

    let to_pid = match take_field(&mut fields, TO_PID) {
        None | Some(Value::Nil) => Recipients::Local,
        Some(value) => recipients_from_value(value)?,
    };

    let exclude_sender = match take_field(&mut fields, EXCLUDE_SENDER) {
        None | Some(Value::Nil) => false,
        Some(Value::Boolean(flag)) => flag,
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "{EXCLUDE_SENDER} must be a bool, got {other}"
            )));
        }
    };

    let body: Arc<dyn PacketBody> = registry.decode_body(kind, Value::Map(fields))?;
    Ok(Packet::from_parts(kind, from_pid, to_pid, exclude_sender, body))
}

fn take_field(fields: &mut Vec<(Value, Value)>, name: &str) -> Option<Value> {
    let index = fields
        .iter()
        .position(|(key, _)| key.as_str() == Some(name))?;
    Some(fields.remove(index).1)
}

fn peer_id_from_value(value: &Value) -> Result<PeerId, CodecError> {
    match value {
        Value::Binary(bytes) => {
            PeerId::try_from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        // Lenient integer-sequence form.
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| {
                            CodecError::Malformed(format!("peer id byte out of range: {item}"))
                        })
                })
                .collect::<Result<Vec<u8>, _>>()?;
            PeerId::try_from_slice(&bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        other => Err(CodecError::Malformed(format!(
            "peer id must be raw bytes, got {other}"
        ))),
    }
}

fn recipients_from_value(value: Value) -> Result<Recipients, CodecError> {
    match value {
        Value::Binary(_) => Ok(Recipients::One(peer_id_from_value(&value)?)),
        Value::Array(items) => {
            // An array of integers is one id in its byte-sequence form; any
            // other array is a recipient list.
            if !items.is_empty() && items.iter().all(|item| item.as_u64().is_some()) {
                return Ok(Recipients::One(peer_id_from_value(&Value::Array(items))?));
            }
            let pids = items
                .iter()
                .map(peer_id_from_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Recipients::Many(pids))
        }
        other => Err(CodecError::Malformed(format!(
            "{TO_PID} must be raw bytes or an array, got {other}"
        ))),
    }
}

/// Size guard applied by the stream framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_frame_payload: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_payload: 64 * 1024,
        }
    }
}

const FRAME_MAGIC: [u8; 2] = *b"RT";
const FRAME_LENGTH_LEN: usize = 4;

/// Number of bytes in a frame header.
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + FRAME_LENGTH_LEN;

/// Errors produced by the stream framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame magic: expected [52,54], got {actual:02X?}")]
    InvalidMagic { actual: [u8; 2] },

    #[error("frame payload exceeds limit: limit={limit} actual={actual}")]
    PayloadTooLarge { limit: usize, actual: usize },
}

/// Wraps one encoded record in a stream frame.
///
/// Frame format:
/// - bytes 0..2: magic `RT`
/// - bytes 2..6: payload length (LE u32)
/// - remaining bytes: one encoded packet record
pub fn encode_frame(payload: &[u8], limits: &CodecLimits) -> Result<Vec<u8>, FrameError> {
    if payload.len() > limits.max_frame_payload {
        return Err(FrameError::PayloadTooLarge {
            limit: limits.max_frame_payload,
            actual: payload.len(),
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Attempts to split one frame off the beginning of `buffer`.
///
/// Returns `Ok(None)` when there are not enough bytes yet; on success the
/// payload and the total number of consumed bytes.
pub fn try_decode_frame(
    buffer: &[u8],
    limits: &CodecLimits,
) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
    if buffer.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let actual_magic = [buffer[0], buffer[1]];
    if actual_magic != FRAME_MAGIC {
        return Err(FrameError::InvalidMagic {
            actual: actual_magic,
        });
    }

    let payload_len = u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]) as usize;
    if payload_len > limits.max_frame_payload {
        return Err(FrameError::PayloadTooLarge {
            limit: limits.max_frame_payload,
            actual: payload_len,
        });
    }

    let total_len = FRAME_HEADER_LEN + payload_len;
    if buffer.len() < total_len {
        return Ok(None);
    }

    Ok(Some((buffer[FRAME_HEADER_LEN..total_len].to_vec(), total_len)))
}
