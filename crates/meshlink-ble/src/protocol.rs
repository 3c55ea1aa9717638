//! Wire protocol for the radio session
//!
//! Frames are exchanged over the transport's ToRadio/FromRadio
//! characteristics with a simple framing header:
//!
//! - Bytes 0-1: Magic number `0x94C3` (big-endian)
//! - Bytes 2-3: Payload length (big-endian u16)
//! - Bytes 4+: Tagged payload
//!
//! The payload is a one-byte frame tag followed by fixed-order fields.
//! Strings are length-prefixed with a single byte. Notifications may arrive
//! fragmented at the transport MTU, so inbound bytes go through a
//! [`FrameReader`] that accumulates until a complete frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use meshlink_core::NodeUpdateKind;

use crate::config::{FRAME_MAGIC, MAX_FRAME_PAYLOAD};
use crate::error::{Result, SessionError};

/// Minimum frame size (magic + length)
const MIN_FRAME_SIZE: usize = 4;

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum RadioFrame {
    /// Request device identity (app → radio)
    WantIdentity,
    /// Device identity response (radio → app)
    Identity {
        /// Mesh node number of the connected radio
        node_num: u32,
        /// Protocol version the radio speaks
        protocol_version: u32,
        /// Firmware version string
        firmware: String,
    },
    /// Request full configuration state (app → radio)
    WantConfig,
    /// End of configuration state (radio → app)
    ConfigComplete {
        /// LoRa region code (0 = unset)
        region: u16,
        /// Number of channels the radio supports
        max_channels: u8,
    },
    /// Subscribe to the node/telemetry notification stream (app → radio)
    Subscribe,
    /// Subscription acknowledged (radio → app)
    SubscribeAck,
    /// A node state update (radio → app)
    NodeUpdate(NodeUpdate),
    /// Outbound text message (app → radio)
    Text {
        /// Packet id for mesh-level deduplication
        packet_id: u32,
        /// Destination node number (0xFFFFFFFF = broadcast)
        to: u32,
        /// Message body
        body: String,
    },
    /// Ask the radio to re-send configuration state (app → radio)
    ConfigRequest,
}

/// One update to a node's persisted state
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    /// Node number the update applies to
    pub num: u32,
    /// Per-kind sequence number, monotonic at the radio
    pub seq: u32,
    /// Update payload
    pub body: NodeUpdateBody,
}

impl NodeUpdate {
    /// The update kind, used as half of the idempotence key
    pub fn kind(&self) -> NodeUpdateKind {
        match self.body {
            NodeUpdateBody::NodeInfo { .. } => NodeUpdateKind::NodeInfo,
            NodeUpdateBody::Position { .. } => NodeUpdateKind::Position,
            NodeUpdateBody::Telemetry { .. } => NodeUpdateKind::Telemetry,
            NodeUpdateBody::Config { .. } => NodeUpdateKind::Config,
        }
    }
}

/// Kind-specific fields of a node update
#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdateBody {
    /// Names and identity
    NodeInfo {
        /// Short display name
        short_name: String,
        /// Long display name
        long_name: String,
    },
    /// GPS position
    Position {
        /// Latitude in degrees
        latitude: f64,
        /// Longitude in degrees
        longitude: f64,
    },
    /// Device telemetry
    Telemetry {
        /// Battery level percent
        battery_level: u32,
        /// Channel utilization percent
        channel_utilization: f32,
        /// Transmit airtime percent
        air_util_tx: f32,
    },
    /// Radio configuration
    Config {
        /// LoRa region code (0 = unset)
        region: u16,
    },
}

// Frame tags
const TAG_WANT_IDENTITY: u8 = 0x01;
const TAG_IDENTITY: u8 = 0x02;
const TAG_WANT_CONFIG: u8 = 0x03;
const TAG_CONFIG_COMPLETE: u8 = 0x04;
const TAG_SUBSCRIBE: u8 = 0x05;
const TAG_SUBSCRIBE_ACK: u8 = 0x06;
const TAG_NODE_UPDATE: u8 = 0x07;
const TAG_TEXT: u8 = 0x08;
const TAG_CONFIG_REQUEST: u8 = 0x09;

impl RadioFrame {
    /// Encode this frame, including the framing header
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity(64);

        match self {
            RadioFrame::WantIdentity => payload.put_u8(TAG_WANT_IDENTITY),
            RadioFrame::Identity {
                node_num,
                protocol_version,
                firmware,
            } => {
                payload.put_u8(TAG_IDENTITY);
                payload.put_u32(*node_num);
                payload.put_u32(*protocol_version);
                put_string(&mut payload, firmware)?;
            }
            RadioFrame::WantConfig => payload.put_u8(TAG_WANT_CONFIG),
            RadioFrame::ConfigComplete {
                region,
                max_channels,
            } => {
                payload.put_u8(TAG_CONFIG_COMPLETE);
                payload.put_u16(*region);
                payload.put_u8(*max_channels);
            }
            RadioFrame::Subscribe => payload.put_u8(TAG_SUBSCRIBE),
            RadioFrame::SubscribeAck => payload.put_u8(TAG_SUBSCRIBE_ACK),
            RadioFrame::NodeUpdate(update) => {
                payload.put_u8(TAG_NODE_UPDATE);
                payload.put_u32(update.num);
                payload.put_u8(update.kind() as u8);
                payload.put_u32(update.seq);
                match &update.body {
                    NodeUpdateBody::NodeInfo {
                        short_name,
                        long_name,
                    } => {
                        put_string(&mut payload, short_name)?;
                        put_string(&mut payload, long_name)?;
                    }
                    NodeUpdateBody::Position {
                        latitude,
                        longitude,
                    } => {
                        payload.put_f64(*latitude);
                        payload.put_f64(*longitude);
                    }
                    NodeUpdateBody::Telemetry {
                        battery_level,
                        channel_utilization,
                        air_util_tx,
                    } => {
                        payload.put_u32(*battery_level);
                        payload.put_f32(*channel_utilization);
                        payload.put_f32(*air_util_tx);
                    }
                    NodeUpdateBody::Config { region } => {
                        payload.put_u16(*region);
                    }
                }
            }
            RadioFrame::Text {
                packet_id,
                to,
                body,
            } => {
                payload.put_u8(TAG_TEXT);
                payload.put_u32(*packet_id);
                payload.put_u32(*to);
                put_string(&mut payload, body)?;
            }
            RadioFrame::ConfigRequest => payload.put_u8(TAG_CONFIG_REQUEST),
        }

        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(SessionError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut framed = BytesMut::with_capacity(MIN_FRAME_SIZE + payload.len());
        framed.put_u16(FRAME_MAGIC);
        framed.put_u16(payload.len() as u16);
        framed.extend_from_slice(&payload);

        trace!(size = framed.len(), "Encoded frame");
        Ok(framed.freeze())
    }

    /// Decode a frame payload (framing header already stripped)
    pub fn decode(payload: &[u8]) -> Result<RadioFrame> {
        let mut buf = Bytes::copy_from_slice(payload);
        let tag = take_u8(&mut buf, "tag")?;

        let frame = match tag {
            TAG_WANT_IDENTITY => RadioFrame::WantIdentity,
            TAG_IDENTITY => RadioFrame::Identity {
                node_num: take_u32(&mut buf, "node_num")?,
                protocol_version: take_u32(&mut buf, "protocol_version")?,
                firmware: take_string(&mut buf, "firmware")?,
            },
            TAG_WANT_CONFIG => RadioFrame::WantConfig,
            TAG_CONFIG_COMPLETE => RadioFrame::ConfigComplete {
                region: take_u16(&mut buf, "region")?,
                max_channels: take_u8(&mut buf, "max_channels")?,
            },
            TAG_SUBSCRIBE => RadioFrame::Subscribe,
            TAG_SUBSCRIBE_ACK => RadioFrame::SubscribeAck,
            TAG_NODE_UPDATE => {
                let num = take_u32(&mut buf, "num")?;
                let kind_tag = take_u8(&mut buf, "kind")?;
                let kind = NodeUpdateKind::try_from(kind_tag)
                    .map_err(|e| SessionError::InvalidFrame(e.to_string()))?;
                let seq = take_u32(&mut buf, "seq")?;
                let body = match kind {
                    NodeUpdateKind::NodeInfo => NodeUpdateBody::NodeInfo {
                        short_name: take_string(&mut buf, "short_name")?,
                        long_name: take_string(&mut buf, "long_name")?,
                    },
                    NodeUpdateKind::Position => NodeUpdateBody::Position {
                        latitude: take_f64(&mut buf, "latitude")?,
                        longitude: take_f64(&mut buf, "longitude")?,
                    },
                    NodeUpdateKind::Telemetry => NodeUpdateBody::Telemetry {
                        battery_level: take_u32(&mut buf, "battery_level")?,
                        channel_utilization: take_f32(&mut buf, "channel_utilization")?,
                        air_util_tx: take_f32(&mut buf, "air_util_tx")?,
                    },
                    NodeUpdateKind::Config => NodeUpdateBody::Config {
                        region: take_u16(&mut buf, "region")?,
                    },
                };
                RadioFrame::NodeUpdate(NodeUpdate { num, seq, body })
            }
            TAG_TEXT => RadioFrame::Text {
                packet_id: take_u32(&mut buf, "packet_id")?,
                to: take_u32(&mut buf, "to")?,
                body: take_string(&mut buf, "body")?,
            },
            TAG_CONFIG_REQUEST => RadioFrame::ConfigRequest,
            other => {
                return Err(SessionError::InvalidFrame(format!(
                    "unknown frame tag 0x{other:02X}"
                )))
            }
        };

        Ok(frame)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return Err(SessionError::InvalidFrame(format!(
            "string too long: {} bytes",
            s.len()
        )));
    }
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn ensure(buf: &Bytes, need: usize, field: &str) -> Result<()> {
    if buf.remaining() < need {
        return Err(SessionError::InvalidFrame(format!(
            "truncated at {field}: need {need} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes, field: &str) -> Result<u8> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes, field: &str) -> Result<u16> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut Bytes, field: &str) -> Result<u32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn take_f32(buf: &mut Bytes, field: &str) -> Result<f32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_f32())
}

fn take_f64(buf: &mut Bytes, field: &str) -> Result<f64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_f64())
}

fn take_string(buf: &mut Bytes, field: &str) -> Result<String> {
    let len = take_u8(buf, field)? as usize;
    ensure(buf, len, field)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SessionError::InvalidFrame(format!("{field}: invalid utf-8")))
}

/// Accumulates transport notifications and yields complete frames.
///
/// Notifications can split a frame across MTU-sized chunks or glue several
/// frames together; the reader scans for the magic number and hands back one
/// decoded payload at a time.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
        }
    }

    /// Feed raw transport bytes into the reader
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discard any buffered partial frame (link reset)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Try to extract the next complete frame payload
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < MIN_FRAME_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
        if magic != FRAME_MAGIC {
            // Not a valid frame start - scan for magic
            if let Some(pos) = self.find_magic() {
                warn!(discarded = pos, "Discarding bytes before magic number");
                self.buffer.advance(pos);
            } else {
                let keep = if self.buffer.last() == Some(&0x94) { 1 } else { 0 };
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    warn!(discarded = discard, "Discarding buffer without magic");
                    self.buffer.advance(discard);
                }
                return Ok(None);
            }

            if self.buffer.len() < MIN_FRAME_SIZE {
                return Ok(None);
            }
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            warn!(length, "Frame length too large, likely corrupt");
            self.buffer.advance(2);
            return Err(SessionError::InvalidFrame(format!(
                "frame length {length} exceeds maximum"
            )));
        }

        let total = MIN_FRAME_SIZE + length;
        if self.buffer.len() < total {
            trace!(
                have = self.buffer.len(),
                need = total,
                "Waiting for complete frame"
            );
            return Ok(None);
        }

        let frame = self.buffer.split_to(total);
        let payload = Bytes::copy_from_slice(&frame[MIN_FRAME_SIZE..]);
        debug!(size = payload.len(), "Received complete frame");
        Ok(Some(payload))
    }

    fn find_magic(&self) -> Option<usize> {
        for i in 0..self.buffer.len().saturating_sub(1) {
            if self.buffer[i] == 0x94 && self.buffer[i + 1] == 0xC3 {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: RadioFrame) {
        let encoded = frame.encode().unwrap();
        let mut reader = FrameReader::new();
        reader.extend(&encoded);
        let payload = reader.next_frame().unwrap().unwrap();
        assert_eq!(RadioFrame::decode(&payload).unwrap(), frame);
    }

    #[test]
    fn test_identity_round_trip() {
        round_trip(RadioFrame::Identity {
            node_num: 0x12345678,
            protocol_version: 1,
            firmware: "2.3.2.f00db43".into(),
        });
    }

    #[test]
    fn test_handshake_markers_round_trip() {
        round_trip(RadioFrame::WantIdentity);
        round_trip(RadioFrame::WantConfig);
        round_trip(RadioFrame::Subscribe);
        round_trip(RadioFrame::SubscribeAck);
        round_trip(RadioFrame::ConfigRequest);
        round_trip(RadioFrame::ConfigComplete {
            region: 3,
            max_channels: 8,
        });
    }

    #[test]
    fn test_node_update_bodies() {
        round_trip(RadioFrame::NodeUpdate(NodeUpdate {
            num: 1234,
            seq: 9,
            body: NodeUpdateBody::Telemetry {
                battery_level: 87,
                channel_utilization: 12.5,
                air_util_tx: 3.25,
            },
        }));
        round_trip(RadioFrame::NodeUpdate(NodeUpdate {
            num: 1234,
            seq: 2,
            body: NodeUpdateBody::NodeInfo {
                short_name: "RDGE".into(),
                long_name: "Ridge Repeater".into(),
            },
        }));
        round_trip(RadioFrame::NodeUpdate(NodeUpdate {
            num: 1,
            seq: 1,
            body: NodeUpdateBody::Config { region: 0 },
        }));
    }

    #[test]
    fn test_kind_mapping() {
        let update = NodeUpdate {
            num: 1,
            seq: 1,
            body: NodeUpdateBody::Position {
                latitude: 45.0,
                longitude: -122.0,
            },
        };
        assert_eq!(update.kind(), NodeUpdateKind::Position);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(RadioFrame::decode(&[0xEE]).is_err());
        assert!(RadioFrame::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_identity() {
        // Identity tag but no fields
        let err = RadioFrame::decode(&[TAG_IDENTITY, 0x00]).unwrap_err();
        assert!(matches!(err, SessionError::InvalidFrame(_)));
    }

    #[test]
    fn test_reader_partial_frame() {
        let encoded = RadioFrame::Subscribe.encode().unwrap();
        let mut reader = FrameReader::new();

        reader.extend(&encoded[..2]);
        assert!(reader.next_frame().unwrap().is_none());

        reader.extend(&encoded[2..]);
        let payload = reader.next_frame().unwrap().unwrap();
        assert_eq!(RadioFrame::decode(&payload).unwrap(), RadioFrame::Subscribe);
    }

    #[test]
    fn test_reader_skips_garbage_before_magic() {
        let encoded = RadioFrame::SubscribeAck.encode().unwrap();
        let mut reader = FrameReader::new();
        reader.extend(b"garbage");
        reader.extend(&encoded);

        let payload = reader.next_frame().unwrap().unwrap();
        assert_eq!(
            RadioFrame::decode(&payload).unwrap(),
            RadioFrame::SubscribeAck
        );
    }

    #[test]
    fn test_reader_two_frames_in_one_notification() {
        let a = RadioFrame::WantIdentity.encode().unwrap();
        let b = RadioFrame::WantConfig.encode().unwrap();

        let mut reader = FrameReader::new();
        let mut glued = Vec::new();
        glued.extend_from_slice(&a);
        glued.extend_from_slice(&b);
        reader.extend(&glued);

        let first = reader.next_frame().unwrap().unwrap();
        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(RadioFrame::decode(&first).unwrap(), RadioFrame::WantIdentity);
        assert_eq!(RadioFrame::decode(&second).unwrap(), RadioFrame::WantConfig);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_string_length_limit() {
        let frame = RadioFrame::Text {
            packet_id: 1,
            to: 0xFFFFFFFF,
            body: "x".repeat(300),
        };
        assert!(frame.encode().is_err());
    }
}
