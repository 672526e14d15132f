//! MQTT-SN wire codec.
//!
//! This module provides the version-independent frame model plus the
//! classification surface the message state machine drives on:
//! - `v1` - MQTT-SN 1.2 wire encoding
//! - `v2` - MQTT-SN 2.0 wire encoding (extended flags/topic layout)
//!
//! Frames are length-prefixed: a 1-byte length for frames under 256 bytes,
//! or a 3-byte long form introduced by 0x01 carrying a big-endian u16 total
//! length. 16-bit integers are big-endian on the wire.

pub mod v1;
pub mod v2;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Message type octets
// ---------------------------------------------------------------------------

pub(crate) mod types {
    pub const CONNECT: u8 = 0x04;
    pub const CONNACK: u8 = 0x05;
    pub const REGISTER: u8 = 0x0A;
    pub const REGACK: u8 = 0x0B;
    pub const PUBLISH: u8 = 0x0C;
    pub const PUBACK: u8 = 0x0D;
    pub const PUBCOMP: u8 = 0x0E;
    pub const PUBREC: u8 = 0x0F;
    pub const PUBREL: u8 = 0x10;
    pub const SUBSCRIBE: u8 = 0x12;
    pub const SUBACK: u8 = 0x13;
    pub const UNSUBSCRIBE: u8 = 0x14;
    pub const UNSUBACK: u8 = 0x15;
    pub const PINGREQ: u8 = 0x16;
    pub const PINGRESP: u8 = 0x17;
    pub const DISCONNECT: u8 = 0x18;
}

const LONG_LENGTH_MARKER: u8 = 0x01;

/// Largest client id accepted on CONNECT/PINGREQ.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Largest topic path accepted by the codec.
pub const MAX_TOPIC_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
    #[error("declared length does not match datagram")]
    LengthMismatch,
    #[error("unsupported protocol id 0x{0:02X}")]
    UnsupportedProtocol(u8),
    #[error("client id must be 1..={MAX_CLIENT_ID_LEN} bytes")]
    BadClientId,
    #[error("short topics must be 1 or 2 characters")]
    BadShortTopic,
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TopicTooLong,
    #[error("frame exceeds maximum encodable length")]
    FrameTooLarge,
}

// ---------------------------------------------------------------------------
// Scalar wire types
// ---------------------------------------------------------------------------

/// Protocol revision negotiated on CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    V1_2,
    V2_0,
}

impl ProtocolVersion {
    pub fn protocol_id(self) -> u8 {
        match self {
            ProtocolVersion::V1_2 => 0x01,
            ProtocolVersion::V2_0 => 0x02,
        }
    }

    pub fn from_protocol_id(id: u8) -> Result<Self, CodecError> {
        match id {
            0x01 => Ok(ProtocolVersion::V1_2),
            0x02 => Ok(ProtocolVersion::V2_0),
            other => Err(CodecError::UnsupportedProtocol(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    /// QoS -1: publish without a connection; never enters the inflight system.
    MinusOne,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Qos {
        match bits & 0x03 {
            0 => Qos::AtMostOnce,
            1 => Qos::AtLeastOnce,
            2 => Qos::ExactlyOnce,
            _ => Qos::MinusOne,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
            Qos::MinusOne => 3,
        }
    }

    /// True for QoS levels whose PUBLISH expects a terminal acknowledgement.
    pub fn needs_ack(self) -> bool {
        matches!(self, Qos::AtLeastOnce | Qos::ExactlyOnce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Accepted,
    RejectedCongested,
    RejectedInvalidTopicId,
    RejectedNotSupported,
    Reserved(u8),
}

impl ReturnCode {
    pub fn from_byte(b: u8) -> ReturnCode {
        match b {
            0 => ReturnCode::Accepted,
            1 => ReturnCode::RejectedCongested,
            2 => ReturnCode::RejectedInvalidTopicId,
            3 => ReturnCode::RejectedNotSupported,
            other => ReturnCode::Reserved(other),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            ReturnCode::Accepted => 0,
            ReturnCode::RejectedCongested => 1,
            ReturnCode::RejectedInvalidTopicId => 2,
            ReturnCode::RejectedNotSupported => 3,
            ReturnCode::Reserved(other) => other,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, ReturnCode::Accepted)
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnCode::Accepted => write!(f, "accepted"),
            ReturnCode::RejectedCongested => write!(f, "rejected: congested"),
            ReturnCode::RejectedInvalidTopicId => write!(f, "rejected: invalid topic id"),
            ReturnCode::RejectedNotSupported => write!(f, "rejected: not supported"),
            ReturnCode::Reserved(code) => write!(f, "reserved return code {code}"),
        }
    }
}

/// How the 16-bit topic field of a PUBLISH is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicIdKind {
    Normal,
    Predefined,
    Short,
}

impl TopicIdKind {
    pub fn from_bits(bits: u8) -> TopicIdKind {
        match bits & 0x03 {
            1 => TopicIdKind::Predefined,
            2 => TopicIdKind::Short,
            _ => TopicIdKind::Normal,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            TopicIdKind::Normal => 0,
            TopicIdKind::Predefined => 1,
            TopicIdKind::Short => 2,
        }
    }
}

/// Topic addressed by a SUBSCRIBE/UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicTarget {
    /// Full topic filter, possibly containing `+`/`#` wildcards.
    Filter(String),
    Predefined(u16),
    Short(String),
}

impl TopicTarget {
    pub fn id_kind(&self) -> TopicIdKind {
        match self {
            TopicTarget::Filter(_) => TopicIdKind::Normal,
            TopicTarget::Predefined(_) => TopicIdKind::Predefined,
            TopicTarget::Short(_) => TopicIdKind::Short,
        }
    }
}

/// Pack a 1- or 2-character short topic into the 16-bit topic id field.
pub fn pack_short_topic(topic: &str) -> Result<u16, CodecError> {
    let bytes = topic.as_bytes();
    match bytes.len() {
        1 => Ok(u16::from(bytes[0]) << 8),
        2 => Ok((u16::from(bytes[0]) << 8) | u16::from(bytes[1])),
        _ => Err(CodecError::BadShortTopic),
    }
}

/// Inverse of [`pack_short_topic`]; a zero low byte means a 1-char topic.
pub fn unpack_short_topic(id: u16) -> String {
    let hi = (id >> 8) as u8;
    let lo = (id & 0xFF) as u8;
    let mut s = String::new();
    s.push(hi as char);
    if lo != 0 {
        s.push(lo as char);
    }
    s
}

// ---------------------------------------------------------------------------
// Frame model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect {
        client_id: String,
        duration: u16,
        clean_session: bool,
        will: bool,
        /// Session expiry interval in seconds; 2.0 only, ignored by 1.2.
        session_expiry: Option<u32>,
    },
    Connack {
        return_code: ReturnCode,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic_name: String,
    },
    Regack {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Publish {
        dup: bool,
        qos: Qos,
        retain: bool,
        topic_kind: TopicIdKind,
        topic_id: u16,
        msg_id: u16,
        payload: Vec<u8>,
    },
    Puback {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Pubrec {
        msg_id: u16,
    },
    Pubrel {
        msg_id: u16,
    },
    Pubcomp {
        msg_id: u16,
    },
    Subscribe {
        dup: bool,
        qos: Qos,
        msg_id: u16,
        topic: TopicTarget,
    },
    Suback {
        qos: Qos,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Unsubscribe {
        msg_id: u16,
        topic: TopicTarget,
    },
    Unsuback {
        msg_id: u16,
    },
    Pingreq {
        client_id: Option<String>,
    },
    Pingresp,
    Disconnect {
        duration: Option<u16>,
    },
}

/// Fieldless discriminant used for logging and response validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Connect,
    Connack,
    Register,
    Regack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameKind::Connect => "CONNECT",
            FrameKind::Connack => "CONNACK",
            FrameKind::Register => "REGISTER",
            FrameKind::Regack => "REGACK",
            FrameKind::Publish => "PUBLISH",
            FrameKind::Puback => "PUBACK",
            FrameKind::Pubrec => "PUBREC",
            FrameKind::Pubrel => "PUBREL",
            FrameKind::Pubcomp => "PUBCOMP",
            FrameKind::Subscribe => "SUBSCRIBE",
            FrameKind::Suback => "SUBACK",
            FrameKind::Unsubscribe => "UNSUBSCRIBE",
            FrameKind::Unsuback => "UNSUBACK",
            FrameKind::Pingreq => "PINGREQ",
            FrameKind::Pingresp => "PINGRESP",
            FrameKind::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Connect { .. } => FrameKind::Connect,
            Frame::Connack { .. } => FrameKind::Connack,
            Frame::Register { .. } => FrameKind::Register,
            Frame::Regack { .. } => FrameKind::Regack,
            Frame::Publish { .. } => FrameKind::Publish,
            Frame::Puback { .. } => FrameKind::Puback,
            Frame::Pubrec { .. } => FrameKind::Pubrec,
            Frame::Pubrel { .. } => FrameKind::Pubrel,
            Frame::Pubcomp { .. } => FrameKind::Pubcomp,
            Frame::Subscribe { .. } => FrameKind::Subscribe,
            Frame::Suback { .. } => FrameKind::Suback,
            Frame::Unsubscribe { .. } => FrameKind::Unsubscribe,
            Frame::Unsuback { .. } => FrameKind::Unsuback,
            Frame::Pingreq { .. } => FrameKind::Pingreq,
            Frame::Pingresp => FrameKind::Pingresp,
            Frame::Disconnect { .. } => FrameKind::Disconnect,
        }
    }

    /// Whether the frame carries a 16-bit packet identifier on the wire.
    pub fn needs_id(&self) -> bool {
        matches!(
            self,
            Frame::Register { .. }
                | Frame::Regack { .. }
                | Frame::Publish { .. }
                | Frame::Puback { .. }
                | Frame::Pubrec { .. }
                | Frame::Pubrel { .. }
                | Frame::Pubcomp { .. }
                | Frame::Subscribe { .. }
                | Frame::Suback { .. }
                | Frame::Unsubscribe { .. }
                | Frame::Unsuback { .. }
        )
    }

    pub fn msg_id(&self) -> u16 {
        match self {
            Frame::Register { msg_id, .. }
            | Frame::Regack { msg_id, .. }
            | Frame::Publish { msg_id, .. }
            | Frame::Puback { msg_id, .. }
            | Frame::Pubrec { msg_id }
            | Frame::Pubrel { msg_id }
            | Frame::Pubcomp { msg_id }
            | Frame::Subscribe { msg_id, .. }
            | Frame::Suback { msg_id, .. }
            | Frame::Unsubscribe { msg_id, .. }
            | Frame::Unsuback { msg_id } => *msg_id,
            _ => 0,
        }
    }

    pub fn set_msg_id(&mut self, id: u16) {
        match self {
            Frame::Register { msg_id, .. }
            | Frame::Regack { msg_id, .. }
            | Frame::Publish { msg_id, .. }
            | Frame::Puback { msg_id, .. }
            | Frame::Pubrec { msg_id }
            | Frame::Pubrel { msg_id }
            | Frame::Pubcomp { msg_id }
            | Frame::Subscribe { msg_id, .. }
            | Frame::Suback { msg_id, .. }
            | Frame::Unsubscribe { msg_id, .. }
            | Frame::Unsuback { msg_id } => *msg_id = id,
            _ => {}
        }
    }

    /// Frames sent by the party that originated the exchange. PUBREL is in
    /// this set: it is the publisher's half of the QoS 2 handshake, so on
    /// receive it resolves against the remote-originated table.
    pub fn is_originating(&self) -> bool {
        matches!(
            self,
            Frame::Connect { .. }
                | Frame::Publish { .. }
                | Frame::Subscribe { .. }
                | Frame::Unsubscribe { .. }
                | Frame::Register { .. }
                | Frame::Pingreq { .. }
                | Frame::Pubrel { .. }
        )
    }

    /// Whether sending this frame opens an inflight slot awaiting a terminal
    /// response. The QoS 2 follow-ups (PUBREC/PUBREL/PUBCOMP) never do: the
    /// pinned PUBLISH entry tracks the whole exchange.
    pub fn requires_response(&self) -> bool {
        match self {
            Frame::Connect { .. }
            | Frame::Register { .. }
            | Frame::Subscribe { .. }
            | Frame::Unsubscribe { .. }
            | Frame::Pingreq { .. } => true,
            Frame::Publish { qos, .. } => qos.needs_ack(),
            _ => false,
        }
    }

    /// Responses that close an inflight exchange. PUBREL is terminal for the
    /// pinned inbound PUBLISH; PUBREC is the mid-flow exception.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Connack { .. }
                | Frame::Regack { .. }
                | Frame::Puback { .. }
                | Frame::Pubcomp { .. }
                | Frame::Pubrel { .. }
                | Frame::Suback { .. }
                | Frame::Unsuback { .. }
                | Frame::Pingresp
                | Frame::Disconnect { .. }
        )
    }

    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Frame::Connack { return_code }
            | Frame::Regack { return_code, .. }
            | Frame::Puback { return_code, .. }
            | Frame::Suback { return_code, .. } => Some(*return_code),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.return_code().is_some_and(ReturnCode::is_error)
    }

    /// Messages that advance the session's liveness clock. Keepalive
    /// traffic is excluded; callers additionally skip error frames.
    pub fn is_active(&self) -> bool {
        !matches!(self, Frame::Pingreq { .. } | Frame::Pingresp)
    }

    pub fn is_publish(&self) -> bool {
        matches!(self, Frame::Publish { .. })
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Frame::Disconnect { .. })
    }

    /// Pairing rules between a stored request and an incoming terminal
    /// response. A remote-pinned PUBLISH is completed by PUBREL; a local
    /// PUBLISH by PUBACK (QoS 1) or PUBCOMP (QoS 2).
    pub fn valid_response(request: &Frame, response: &Frame) -> bool {
        matches!(
            (request.kind(), response.kind()),
            (FrameKind::Connect, FrameKind::Connack)
                | (FrameKind::Register, FrameKind::Regack)
                | (FrameKind::Subscribe, FrameKind::Suback)
                | (FrameKind::Unsubscribe, FrameKind::Unsuback)
                | (FrameKind::Pingreq, FrameKind::Pingresp)
                | (FrameKind::Publish, FrameKind::Puback)
                | (FrameKind::Publish, FrameKind::Pubcomp)
                | (FrameKind::Publish, FrameKind::Pubrel)
        )
    }
}

// ---------------------------------------------------------------------------
// Length framing shared by both wire versions
// ---------------------------------------------------------------------------

/// Prefix `body` (message type byte included by the caller) with the
/// length field, choosing the 1-byte or 3-byte form.
pub(crate) fn wrap_frame(msg_type: u8, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let short_total = body.len() + 2;
    if short_total < 256 {
        let mut out = Vec::with_capacity(short_total);
        out.push(short_total as u8);
        out.push(msg_type);
        out.extend_from_slice(body);
        return Ok(out);
    }
    let long_total = body.len() + 4;
    if long_total > usize::from(u16::MAX) {
        return Err(CodecError::FrameTooLarge);
    }
    let mut out = Vec::with_capacity(long_total);
    out.push(LONG_LENGTH_MARKER);
    out.extend_from_slice(&(long_total as u16).to_be_bytes());
    out.push(msg_type);
    out.extend_from_slice(body);
    Ok(out)
}

/// Strip the length prefix, returning the message type octet and body.
pub(crate) fn unwrap_frame(buf: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated);
    }
    if buf[0] == LONG_LENGTH_MARKER {
        if buf.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let declared = usize::from(u16::from_be_bytes([buf[1], buf[2]]));
        if declared != buf.len() {
            return Err(CodecError::LengthMismatch);
        }
        Ok((buf[3], &buf[4..]))
    } else {
        let declared = usize::from(buf[0]);
        if declared != buf.len() {
            return Err(CodecError::LengthMismatch);
        }
        Ok((buf[1], &buf[2..]))
    }
}

/// Read the message type octet without consuming the datagram; used by the
/// gateway to sniff CONNECT frames before the peer's version is known.
pub fn peek_type(buf: &[u8]) -> Result<u8, CodecError> {
    let (msg_type, _) = unwrap_frame(buf)?;
    Ok(msg_type)
}

/// Read the protocol id of a CONNECT datagram (either wire version places
/// it in the second body octet).
pub fn peek_connect_version(buf: &[u8]) -> Result<ProtocolVersion, CodecError> {
    let (msg_type, body) = unwrap_frame(buf)?;
    if msg_type != types::CONNECT || body.len() < 2 {
        return Err(CodecError::Truncated);
    }
    ProtocolVersion::from_protocol_id(body[1])
}

// ---------------------------------------------------------------------------
// Version dispatch
// ---------------------------------------------------------------------------

pub fn encode(version: ProtocolVersion, frame: &Frame) -> Result<Vec<u8>, CodecError> {
    match version {
        ProtocolVersion::V1_2 => v1::encode(frame),
        ProtocolVersion::V2_0 => v2::encode(frame),
    }
}

pub fn decode(version: ProtocolVersion, buf: &[u8]) -> Result<Frame, CodecError> {
    match version {
        ProtocolVersion::V1_2 => v1::decode(buf),
        ProtocolVersion::V2_0 => v2::decode(buf),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
