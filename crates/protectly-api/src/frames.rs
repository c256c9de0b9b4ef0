// Binary update-frame codec for the realtime events endpoint.
//
// An update packet is two consecutive frames: an action frame followed by
// a payload frame. Each frame carries an 8-byte header:
//
//   byte 0      frame type       1 = action, 2 = payload
//   byte 1      payload format   1 = JSON, 2 = UTF-8 string, 3 = raw bytes
//   byte 2      compression      0 = plain, 1 = zlib deflate
//   byte 3      reserved
//   bytes 4-7   payload length   big-endian u32, bytes following the header
//
// Action frames are always JSON. The payload frame starts at
// `action payload length + 8` into the packet; the packet's total length
// must match the sum of both frames exactly or the packet is rejected.

use std::io::Read;
use std::io::Write;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Size of a frame header, in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frame type tag (header byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Action = 1,
    Payload = 2,
}

/// Payload format tag (header byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json = 1,
    Utf8 = 2,
    Buffer = 3,
}

/// The decoded action frame of an update packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFrame {
    /// Action verb, e.g. `"update"` or `"add"`.
    pub action: String,

    /// Id of the entity this update applies to.
    pub id: String,

    /// Entity kind, e.g. `"camera"` or `"nvr"`.
    pub model_key: String,

    /// Replacement stream cursor, when the server advances it.
    #[serde(default)]
    pub new_update_id: Option<String>,
}

/// The decoded payload frame of an update packet, tagged by wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    Json(serde_json::Value),
    Text(String),
    Raw(Vec<u8>),
}

impl UpdatePayload {
    /// The JSON value, if this payload is format 1.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    fn format(&self) -> PayloadFormat {
        match self {
            Self::Json(_) => PayloadFormat::Json,
            Self::Text(_) => PayloadFormat::Utf8,
            Self::Raw(_) => PayloadFormat::Buffer,
        }
    }
}

/// Exactly one action frame paired with exactly one payload frame.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePacket {
    pub action: ActionFrame,
    pub payload: UpdatePayload,
}

impl UpdatePacket {
    /// `true` when this packet is a camera state update -- the only kind
    /// forwarded to dispatch.
    pub fn is_camera_update(&self) -> bool {
        self.action.action == "update" && self.action.model_key == "camera"
    }
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode a raw update packet into its action/payload pair.
///
/// Rejects (never panics on) truncated packets, length mismatches between
/// the header fields and the actual buffer, non-JSON action frames, and
/// unknown payload formats.
pub fn decode_update_packet(packet: &[u8]) -> Result<UpdatePacket, Error> {
    if packet.len() < FRAME_HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "packet too short for a header ({} bytes)",
            packet.len()
        )));
    }

    // Bytes 4-7 of the packet are the action frame's payload length; the
    // payload frame begins right after it.
    let action_len = read_be_u32(packet, 4)? as usize;
    let data_offset = action_len + FRAME_HEADER_SIZE;

    if packet.len() < data_offset + FRAME_HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "packet too short for a payload header (len {}, data offset {data_offset})",
            packet.len()
        )));
    }

    let payload_len = read_be_u32(packet, data_offset + 4)? as usize;
    if packet.len() != data_offset + FRAME_HEADER_SIZE + payload_len {
        return Err(Error::MalformedFrame(format!(
            "packet length {} doesn't match header information (expected {})",
            packet.len(),
            data_offset + FRAME_HEADER_SIZE + payload_len
        )));
    }

    let action = decode_action_frame(&packet[..data_offset])?;
    let payload = decode_payload_frame(&packet[data_offset..])?;

    Ok(UpdatePacket { action, payload })
}

fn decode_action_frame(frame: &[u8]) -> Result<ActionFrame, Error> {
    let (format, body) = decode_frame_body(frame, FrameType::Action)?;

    // Action frames have exactly one legal format.
    if format != PayloadFormat::Json as u8 {
        return Err(Error::MalformedFrame(format!(
            "action frame with non-JSON format {format}"
        )));
    }

    serde_json::from_slice(&body)
        .map_err(|e| Error::MalformedFrame(format!("action frame JSON: {e}")))
}

fn decode_payload_frame(frame: &[u8]) -> Result<UpdatePayload, Error> {
    let (format, body) = decode_frame_body(frame, FrameType::Payload)?;

    match format {
        f if f == PayloadFormat::Json as u8 => serde_json::from_slice(&body)
            .map(UpdatePayload::Json)
            .map_err(|e| Error::MalformedFrame(format!("payload frame JSON: {e}"))),
        f if f == PayloadFormat::Utf8 as u8 => String::from_utf8(body)
            .map(UpdatePayload::Text)
            .map_err(|e| Error::MalformedFrame(format!("payload frame UTF-8: {e}"))),
        f if f == PayloadFormat::Buffer as u8 => Ok(UpdatePayload::Raw(body)),
        unknown => Err(Error::MalformedFrame(format!(
            "unknown payload format {unknown}"
        ))),
    }
}

/// Validate one frame's header against the expected type and return its
/// (format tag, decompressed body).
fn decode_frame_body(frame: &[u8], expected: FrameType) -> Result<(u8, Vec<u8>), Error> {
    let frame_type = frame[0];
    if frame_type != expected as u8 {
        return Err(Error::MalformedFrame(format!(
            "expected frame type {}, got {frame_type}",
            expected as u8
        )));
    }

    let format = frame[1];
    let compressed = frame[2] != 0;
    let body = &frame[FRAME_HEADER_SIZE..];

    if compressed {
        let mut inflated = Vec::new();
        ZlibDecoder::new(body)
            .read_to_end(&mut inflated)
            .map_err(|e| Error::MalformedFrame(format!("inflate failed: {e}")))?;
        Ok((format, inflated))
    } else {
        Ok((format, body.to_vec()))
    }
}

fn read_be_u32(buf: &[u8], offset: usize) -> Result<u32, Error> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::MalformedFrame(format!("length field truncated at {offset}")))?;
    Ok(u32::from_be_bytes(bytes))
}

// ── Encoding ────────────────────────────────────────────────────────

/// Encode an action/payload pair into a wire packet.
///
/// Counterpart to [`decode_update_packet`] -- used by loopback test
/// servers and NVR simulators.
pub fn encode_update_packet(
    action: &ActionFrame,
    payload: &UpdatePayload,
    compress: bool,
) -> Result<Vec<u8>, Error> {
    let action_body = serde_json::to_vec(action)
        .map_err(|e| Error::MalformedFrame(format!("action frame encode: {e}")))?;
    let payload_body = match payload {
        UpdatePayload::Json(v) => serde_json::to_vec(v)
            .map_err(|e| Error::MalformedFrame(format!("payload frame encode: {e}")))?,
        UpdatePayload::Text(s) => s.as_bytes().to_vec(),
        UpdatePayload::Raw(b) => b.clone(),
    };

    let mut packet = encode_frame(FrameType::Action, PayloadFormat::Json, &action_body, compress)?;
    packet.extend(encode_frame(
        FrameType::Payload,
        payload.format(),
        &payload_body,
        compress,
    )?);
    Ok(packet)
}

fn encode_frame(
    frame_type: FrameType,
    format: PayloadFormat,
    body: &[u8],
    compress: bool,
) -> Result<Vec<u8>, Error> {
    let body = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body)
            .and_then(|()| encoder.finish())
            .map_err(|e| Error::MalformedFrame(format!("deflate failed: {e}")))?
    } else {
        body.to_vec()
    };

    let len = u32::try_from(body.len())
        .map_err(|_| Error::MalformedFrame("frame body exceeds u32 length".into()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.push(frame_type as u8);
    frame.push(format as u8);
    frame.push(u8::from(compress));
    frame.push(0); // reserved
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ── Tests ───────────────────────────────────────────────────────────
