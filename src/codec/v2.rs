//! MQTT-SN 2.0 wire encoding.
//!
//! 2.0 shares the 1.2 message set and the state machine's classification;
//! the differences the codec absorbs are the CONNECT session-expiry field
//! and the reshuffled publish/subscribe flags octet:
//! DUP(1) | RETAIN(1) | QoS(2) | reserved(2) | TopicIdType(2).

use super::v1::{check_client_id, read_string, read_u16, read_u32, read_u8};
use super::{
    types, unwrap_frame, wrap_frame, CodecError, Frame, ProtocolVersion, Qos, TopicIdKind,
    TopicTarget,
};

const DUP: u8 = 0x80;
const RETAIN: u8 = 0x40;
const QOS_MASK: u8 = 0x30;
const QOS_SHIFT: u8 = 4;
const TOPIC_KIND_MASK: u8 = 0x03;

fn flags_byte(dup: bool, retain: bool, qos: Qos, kind: TopicIdKind) -> u8 {
    let mut b = (qos.bits() << QOS_SHIFT) | (kind.bits() & TOPIC_KIND_MASK);
    if dup {
        b |= DUP;
    }
    if retain {
        b |= RETAIN;
    }
    b
}

fn split_flags(byte: u8) -> (bool, bool, Qos, TopicIdKind) {
    (
        byte & DUP != 0,
        byte & RETAIN != 0,
        Qos::from_bits((byte & QOS_MASK) >> QOS_SHIFT),
        TopicIdKind::from_bits(byte & TOPIC_KIND_MASK),
    )
}

const CONNECT_CLEAN: u8 = 0x01;
const CONNECT_WILL: u8 = 0x02;

pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    match frame {
        Frame::Connect {
            client_id,
            duration,
            clean_session,
            will,
            session_expiry,
        } => {
            check_client_id(client_id)?;
            let mut flags = 0u8;
            if *clean_session {
                flags |= CONNECT_CLEAN;
            }
            if *will {
                flags |= CONNECT_WILL;
            }
            let mut body = Vec::with_capacity(8 + client_id.len());
            body.push(flags);
            body.push(ProtocolVersion::V2_0.protocol_id());
            body.extend_from_slice(&duration.to_be_bytes());
            body.extend_from_slice(&session_expiry.unwrap_or(0).to_be_bytes());
            body.extend_from_slice(client_id.as_bytes());
            wrap_frame(types::CONNECT, &body)
        }
        Frame::Publish {
            dup,
            qos,
            retain,
            topic_kind,
            topic_id,
            msg_id,
            payload,
        } => {
            let mut body = Vec::with_capacity(5 + payload.len());
            body.push(flags_byte(*dup, *retain, *qos, *topic_kind));
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(payload);
            wrap_frame(types::PUBLISH, &body)
        }
        Frame::Subscribe {
            dup,
            qos,
            msg_id,
            topic,
        } => {
            let mut body = Vec::new();
            body.push(flags_byte(*dup, false, *qos, topic.id_kind()));
            body.extend_from_slice(&msg_id.to_be_bytes());
            subscribe_topic_bytes(topic, &mut body)?;
            wrap_frame(types::SUBSCRIBE, &body)
        }
        Frame::Unsubscribe { msg_id, topic } => {
            let mut body = Vec::new();
            body.push(flags_byte(false, false, Qos::AtMostOnce, topic.id_kind()));
            body.extend_from_slice(&msg_id.to_be_bytes());
            subscribe_topic_bytes(topic, &mut body)?;
            wrap_frame(types::UNSUBSCRIBE, &body)
        }
        // Everything else is byte-identical across revisions.
        other => super::v1::encode(other),
    }
}

fn subscribe_topic_bytes(topic: &TopicTarget, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match topic {
        TopicTarget::Filter(path) => {
            super::v1::check_topic(path)?;
            out.extend_from_slice(path.as_bytes());
        }
        TopicTarget::Predefined(id) => out.extend_from_slice(&id.to_be_bytes()),
        TopicTarget::Short(s) => {
            out.extend_from_slice(&super::pack_short_topic(s)?.to_be_bytes());
        }
    }
    Ok(())
}

fn parse_subscribe_topic(
    kind: TopicIdKind,
    buf: &[u8],
    cursor: &mut usize,
) -> Result<TopicTarget, CodecError> {
    match kind {
        TopicIdKind::Normal => {
            let path = read_string(buf, cursor)?;
            super::v1::check_topic(&path)?;
            Ok(TopicTarget::Filter(path))
        }
        TopicIdKind::Predefined => Ok(TopicTarget::Predefined(read_u16(buf, cursor)?)),
        TopicIdKind::Short => Ok(TopicTarget::Short(super::unpack_short_topic(read_u16(
            buf, cursor,
        )?))),
    }
}

pub fn decode(buf: &[u8]) -> Result<Frame, CodecError> {
    let (msg_type, body) = unwrap_frame(buf)?;
    let mut cursor = 0usize;
    match msg_type {
        types::CONNECT => {
            let flags = read_u8(body, &mut cursor)?;
            let protocol_id = read_u8(body, &mut cursor)?;
            if protocol_id != ProtocolVersion::V2_0.protocol_id() {
                return Err(CodecError::UnsupportedProtocol(protocol_id));
            }
            let duration = read_u16(body, &mut cursor)?;
            let session_expiry = read_u32(body, &mut cursor)?;
            let client_id = read_string(body, &mut cursor)?;
            check_client_id(&client_id)?;
            Ok(Frame::Connect {
                client_id,
                duration,
                clean_session: flags & CONNECT_CLEAN != 0,
                will: flags & CONNECT_WILL != 0,
                session_expiry: Some(session_expiry),
            })
        }
        types::PUBLISH => {
            let (dup, retain, qos, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let topic_id = read_u16(body, &mut cursor)?;
            let msg_id = read_u16(body, &mut cursor)?;
            Ok(Frame::Publish {
                dup,
                qos,
                retain,
                topic_kind,
                topic_id,
                msg_id,
                payload: body[cursor..].to_vec(),
            })
        }
        types::SUBSCRIBE => {
            let (dup, _, qos, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let msg_id = read_u16(body, &mut cursor)?;
            let topic = parse_subscribe_topic(topic_kind, body, &mut cursor)?;
            Ok(Frame::Subscribe {
                dup,
                qos,
                msg_id,
                topic,
            })
        }
        types::UNSUBSCRIBE => {
            let (_, _, _, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let msg_id = read_u16(body, &mut cursor)?;
            let topic = parse_subscribe_topic(topic_kind, body, &mut cursor)?;
            Ok(Frame::Unsubscribe { msg_id, topic })
        }
        _ => super::v1::decode(buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips_session_expiry() {
        let frame = Frame::Connect {
            client_id: "sensor-9".into(),
            duration: 120,
            clean_session: true,
            will: false,
            session_expiry: Some(3600),
        };
        let framed = encode(&frame).unwrap();
        assert_eq!(decode(&framed).unwrap(), frame);
    }

    #[test]
    fn publish_flags_use_the_v2_layout() {
        let framed = encode(&Frame::Publish {
            dup: true,
            qos: Qos::ExactlyOnce,
            retain: true,
            topic_kind: TopicIdKind::Normal,
            topic_id: 4,
            msg_id: 5,
            payload: vec![0xAA],
        })
        .unwrap();
        assert_eq!(framed[2], DUP | RETAIN | (2 << QOS_SHIFT));
    }

    #[test]
    fn shared_frames_delegate_to_v1_encoding() {
        let frame = Frame::Pubrel { msg_id: 11 };
        assert_eq!(encode(&frame).unwrap(), super::super::v1::encode(&frame).unwrap());
        assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
    }
}
