//! Binary wire image for messages.
//!
//! Layout, all multi-byte header fields big-endian:
//!
//! ```text
//! magic            4 bytes  "HMSG"
//! total_length     4 bytes  bytes following this field
//! version          2 bytes  current = 3 (2 accepted as legacy)
//! reserved         2 bytes  must be zero
//! metadata_length  4 bytes
//! metadata         key=value pairs separated by 0x1F
//! payload          value-container binary (see codec)
//! ```
//!
//! Metadata carries id, topic, source, target, correlation_id, trace_id,
//! type, priority, timestamp, ttl and headers (as `hdr.<name>=<value>`
//! pairs). Optional fields are omitted when absent; version-2 frames simply
//! lack the task-era fields, so the keyed decoder accepts them unchanged.

use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::codec;
use crate::error::{BusError, BusResult};
use crate::message::{Message, MessageId, MessageType, Priority};

/// Frame magic
pub const MAGIC: [u8; 4] = *b"HMSG";
/// Current wire version
pub const WIRE_VERSION: u16 = 3;
/// Oldest version accepted on decode
pub const LEGACY_VERSION: u16 = 2;

const SEP: u8 = 0x1F;
const HEADER_PREFIX: &str = "hdr.";

/// Encode a message into its framed wire image.
pub fn encode_frame(message: &Message) -> BusResult<Vec<u8>> {
    let metadata = encode_metadata(message)?;
    let payload = codec::encode(&message.payload)?;

    let total_length = 2 + 2 + 4 + metadata.len() + payload.len();
    let total_u32 = u32::try_from(total_length).map_err(|_| BusError::MessageTooLarge {
        size: total_length,
        max: u32::MAX as usize,
    })?;

    let mut out = Vec::with_capacity(8 + total_length);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&total_u32.to_be_bytes());
    out.extend_from_slice(&WIRE_VERSION.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
    out.extend_from_slice(&metadata);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a framed wire image back into a message.
pub fn decode_frame(bytes: &[u8]) -> BusResult<Message> {
    if bytes.len() < 8 {
        return Err(BusError::InvalidMessage("frame shorter than header".into()));
    }
    if bytes[0..4] != MAGIC {
        return Err(BusError::InvalidMessage("bad frame magic".into()));
    }

    let total_length = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let body = &bytes[8..];
    if body.len() != total_length {
        return Err(BusError::InvalidMessage(format!(
            "frame length mismatch: header says {total_length}, got {}",
            body.len()
        )));
    }
    if body.len() < 8 {
        return Err(BusError::InvalidMessage("frame body truncated".into()));
    }

    let version = u16::from_be_bytes(body[0..2].try_into().unwrap());
    if version != WIRE_VERSION && version != LEGACY_VERSION {
        return Err(BusError::InvalidMessage(format!(
            "unsupported wire version {version}"
        )));
    }
    let reserved = u16::from_be_bytes(body[2..4].try_into().unwrap());
    if reserved != 0 {
        return Err(BusError::InvalidMessage("reserved field must be zero".into()));
    }

    let metadata_length = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    if body.len() < 8 + metadata_length {
        return Err(BusError::InvalidMessage("metadata overruns frame".into()));
    }
    let metadata = &body[8..8 + metadata_length];
    let payload_bytes = &body[8 + metadata_length..];

    let mut message = decode_metadata(metadata)?;
    message.payload = codec::decode(payload_bytes)?;
    Ok(message)
}

fn push_pair(out: &mut Vec<u8>, key: &str, value: &str) -> BusResult<()> {
    if value.bytes().any(|b| b == SEP) {
        return Err(BusError::InvalidMessage(format!(
            "metadata value for '{key}' contains the separator byte"
        )));
    }
    if !out.is_empty() {
        out.push(SEP);
    }
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn encode_metadata(message: &Message) -> BusResult<Vec<u8>> {
    let mut out = Vec::new();
    push_pair(&mut out, "id", &message.id.to_string())?;
    push_pair(&mut out, "topic", &message.topic)?;
    if let Some(source) = &message.source {
        push_pair(&mut out, "source", source)?;
    }
    if let Some(target) = &message.target {
        push_pair(&mut out, "target", target)?;
    }
    if let Some(correlation) = &message.correlation_id {
        push_pair(&mut out, "correlation_id", correlation)?;
    }
    if let Some(trace) = &message.trace_id {
        push_pair(&mut out, "trace_id", trace)?;
    }
    push_pair(&mut out, "type", message.kind.as_str())?;
    push_pair(&mut out, "priority", message.priority.as_str())?;
    push_pair(
        &mut out,
        "timestamp",
        &message.timestamp.timestamp_millis().to_string(),
    )?;
    if let Some(ttl) = message.ttl {
        push_pair(&mut out, "ttl", &ttl.as_millis().to_string())?;
    }
    for (name, value) in &message.headers {
        if name.bytes().any(|b| b == SEP || b == b'=') {
            return Err(BusError::InvalidMessage(format!(
                "header name '{name}' contains a reserved byte"
            )));
        }
        push_pair(&mut out, &format!("{HEADER_PREFIX}{name}"), value)?;
    }
    Ok(out)
}

fn decode_metadata(metadata: &[u8]) -> BusResult<Message> {
    let text = std::str::from_utf8(metadata)
        .map_err(|e| BusError::InvalidMessage(format!("metadata is not UTF-8: {e}")))?;

    let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
    let mut headers = BTreeMap::new();

    for pair in text.split(SEP as char).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            BusError::InvalidMessage(format!("metadata pair without '=': '{pair}'"))
        })?;
        if let Some(name) = key.strip_prefix(HEADER_PREFIX) {
            headers.insert(name.to_string(), value.to_string());
        } else {
            fields.insert(key, value);
        }
    }

    let required = |key: &str| -> BusResult<&str> {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| BusError::InvalidMessage(format!("metadata missing '{key}'")))
    };

    let id = MessageId::from_string(required("id")?)?;
    let topic = required("topic")?.to_string();
    let kind = MessageType::parse(required("type")?)?;
    let priority = Priority::parse(required("priority")?)?;

    let millis: i64 = required("timestamp")?
        .parse()
        .map_err(|e| BusError::InvalidMessage(format!("bad timestamp: {e}")))?;
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| BusError::InvalidMessage(format!("timestamp out of range: {millis}")))?;

    let ttl = match fields.get("ttl") {
        Some(raw) => Some(Duration::from_millis(raw.parse().map_err(|e| {
            BusError::InvalidMessage(format!("bad ttl: {e}"))
        })?)),
        None => None,
    };

    Ok(Message {
        id,
        topic,
        source: fields.get("source").map(|s| s.to_string()),
        target: fields.get("target").map(|s| s.to_string()),
        correlation_id: fields.get("correlation_id").map(|s| s.to_string()),
        trace_id: fields.get("trace_id").map(|s| s.to_string()),
        kind,
        priority,
        timestamp,
        ttl,
        headers,
        payload: Default::default(),
    })
}
