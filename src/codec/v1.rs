//! MQTT-SN 1.2 wire encoding.
//!
//! Body layouts follow the 1.2 specification: little endian is never used;
//! all 16-bit fields are big-endian. The PUBLISH/SUBSCRIBE flags octet is
//! DUP(1) | QoS(2) | RETAIN(1) | WILL(1) | CLEAN(1) | TopicIdType(2).

use bitflags::bitflags;

use super::{
    pack_short_topic, types, unpack_short_topic, unwrap_frame, wrap_frame, CodecError, Frame,
    ProtocolVersion, Qos, ReturnCode, TopicIdKind, TopicTarget, MAX_CLIENT_ID_LEN, MAX_TOPIC_LEN,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Flags: u8 {
        const DUP = 0x80;
        const RETAIN = 0x10;
        const WILL = 0x08;
        const CLEAN = 0x04;
    }
}

const QOS_MASK: u8 = 0x60;
const QOS_SHIFT: u8 = 5;
const TOPIC_KIND_MASK: u8 = 0x03;

pub(crate) fn flags_byte(flags: Flags, qos: Qos, kind: TopicIdKind) -> u8 {
    flags.bits() | (qos.bits() << QOS_SHIFT) | (kind.bits() & TOPIC_KIND_MASK)
}

pub(crate) fn split_flags(byte: u8) -> (Flags, Qos, TopicIdKind) {
    (
        Flags::from_bits_truncate(byte),
        Qos::from_bits((byte & QOS_MASK) >> QOS_SHIFT),
        TopicIdKind::from_bits(byte & TOPIC_KIND_MASK),
    )
}

// ---------------------------------------------------------------------------
// Cursor helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, CodecError> {
    let b = *buf.get(*cursor).ok_or(CodecError::Truncated)?;
    *cursor += 1;
    Ok(b)
}

pub(crate) fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    if buf.len() < *cursor + 2 {
        return Err(CodecError::Truncated);
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

pub(crate) fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    if buf.len() < *cursor + 4 {
        return Err(CodecError::Truncated);
    }
    let v = u32::from_be_bytes([
        buf[*cursor],
        buf[*cursor + 1],
        buf[*cursor + 2],
        buf[*cursor + 3],
    ]);
    *cursor += 4;
    Ok(v)
}

pub(crate) fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
    let rest = &buf[*cursor..];
    *cursor = buf.len();
    String::from_utf8(rest.to_vec()).map_err(|_| CodecError::Truncated)
}

pub(crate) fn check_client_id(client_id: &str) -> Result<(), CodecError> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(CodecError::BadClientId);
    }
    Ok(())
}

pub(crate) fn check_topic(topic: &str) -> Result<(), CodecError> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(CodecError::TopicTooLong);
    }
    Ok(())
}

fn subscribe_topic_bytes(topic: &TopicTarget, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match topic {
        TopicTarget::Filter(path) => {
            check_topic(path)?;
            out.extend_from_slice(path.as_bytes());
        }
        TopicTarget::Predefined(id) => out.extend_from_slice(&id.to_be_bytes()),
        TopicTarget::Short(s) => out.extend_from_slice(&pack_short_topic(s)?.to_be_bytes()),
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
            check_topic(&path)?;
            Ok(TopicTarget::Filter(path))
        }
        TopicIdKind::Predefined => Ok(TopicTarget::Predefined(read_u16(buf, cursor)?)),
        TopicIdKind::Short => Ok(TopicTarget::Short(unpack_short_topic(read_u16(
            buf, cursor,
        )?))),
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    let msg_type = match frame {
        Frame::Connect {
            client_id,
            duration,
            clean_session,
            will,
            session_expiry: _,
        } => {
            check_client_id(client_id)?;
            let mut flags = Flags::empty();
            flags.set(Flags::CLEAN, *clean_session);
            flags.set(Flags::WILL, *will);
            body.push(flags.bits());
            body.push(ProtocolVersion::V1_2.protocol_id());
            body.extend_from_slice(&duration.to_be_bytes());
            body.extend_from_slice(client_id.as_bytes());
            types::CONNECT
        }
        Frame::Connack { return_code } => {
            body.push(return_code.byte());
            types::CONNACK
        }
        Frame::Register {
            topic_id,
            msg_id,
            topic_name,
        } => {
            check_topic(topic_name)?;
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(topic_name.as_bytes());
            types::REGISTER
        }
        Frame::Regack {
            topic_id,
            msg_id,
            return_code,
        } => {
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.push(return_code.byte());
            types::REGACK
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
            let mut flags = Flags::empty();
            flags.set(Flags::DUP, *dup);
            flags.set(Flags::RETAIN, *retain);
            body.push(flags_byte(flags, *qos, *topic_kind));
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.extend_from_slice(payload);
            types::PUBLISH
        }
        Frame::Puback {
            topic_id,
            msg_id,
            return_code,
        } => {
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.push(return_code.byte());
            types::PUBACK
        }
        Frame::Pubrec { msg_id } => {
            body.extend_from_slice(&msg_id.to_be_bytes());
            types::PUBREC
        }
        Frame::Pubrel { msg_id } => {
            body.extend_from_slice(&msg_id.to_be_bytes());
            types::PUBREL
        }
        Frame::Pubcomp { msg_id } => {
            body.extend_from_slice(&msg_id.to_be_bytes());
            types::PUBCOMP
        }
        Frame::Subscribe {
            dup,
            qos,
            msg_id,
            topic,
        } => {
            let mut flags = Flags::empty();
            flags.set(Flags::DUP, *dup);
            body.push(flags_byte(flags, *qos, topic.id_kind()));
            body.extend_from_slice(&msg_id.to_be_bytes());
            subscribe_topic_bytes(topic, &mut body)?;
            types::SUBSCRIBE
        }
        Frame::Suback {
            qos,
            topic_id,
            msg_id,
            return_code,
        } => {
            body.push(flags_byte(Flags::empty(), *qos, TopicIdKind::Normal));
            body.extend_from_slice(&topic_id.to_be_bytes());
            body.extend_from_slice(&msg_id.to_be_bytes());
            body.push(return_code.byte());
            types::SUBACK
        }
        Frame::Unsubscribe { msg_id, topic } => {
            body.push(flags_byte(
                Flags::empty(),
                Qos::AtMostOnce,
                topic.id_kind(),
            ));
            body.extend_from_slice(&msg_id.to_be_bytes());
            subscribe_topic_bytes(topic, &mut body)?;
            types::UNSUBSCRIBE
        }
        Frame::Unsuback { msg_id } => {
            body.extend_from_slice(&msg_id.to_be_bytes());
            types::UNSUBACK
        }
        Frame::Pingreq { client_id } => {
            if let Some(id) = client_id {
                check_client_id(id)?;
                body.extend_from_slice(id.as_bytes());
            }
            types::PINGREQ
        }
        Frame::Pingresp => types::PINGRESP,
        Frame::Disconnect { duration } => {
            if let Some(d) = duration {
                body.extend_from_slice(&d.to_be_bytes());
            }
            types::DISCONNECT
        }
    };
    wrap_frame(msg_type, &body)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode(buf: &[u8]) -> Result<Frame, CodecError> {
    let (msg_type, body) = unwrap_frame(buf)?;
    let mut cursor = 0usize;
    match msg_type {
        types::CONNECT => {
            let flags = Flags::from_bits_truncate(read_u8(body, &mut cursor)?);
            let protocol_id = read_u8(body, &mut cursor)?;
            if protocol_id != ProtocolVersion::V1_2.protocol_id() {
                return Err(CodecError::UnsupportedProtocol(protocol_id));
            }
            let duration = read_u16(body, &mut cursor)?;
            let client_id = read_string(body, &mut cursor)?;
            check_client_id(&client_id)?;
            Ok(Frame::Connect {
                client_id,
                duration,
                clean_session: flags.contains(Flags::CLEAN),
                will: flags.contains(Flags::WILL),
                session_expiry: None,
            })
        }
        types::CONNACK => Ok(Frame::Connack {
            return_code: ReturnCode::from_byte(read_u8(body, &mut cursor)?),
        }),
        types::REGISTER => {
            let topic_id = read_u16(body, &mut cursor)?;
            let msg_id = read_u16(body, &mut cursor)?;
            let topic_name = read_string(body, &mut cursor)?;
            check_topic(&topic_name)?;
            Ok(Frame::Register {
                topic_id,
                msg_id,
                topic_name,
            })
        }
        types::REGACK => Ok(Frame::Regack {
            topic_id: read_u16(body, &mut cursor)?,
            msg_id: read_u16(body, &mut cursor)?,
            return_code: ReturnCode::from_byte(read_u8(body, &mut cursor)?),
        }),
        types::PUBLISH => {
            let (flags, qos, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let topic_id = read_u16(body, &mut cursor)?;
            let msg_id = read_u16(body, &mut cursor)?;
            Ok(Frame::Publish {
                dup: flags.contains(Flags::DUP),
                qos,
                retain: flags.contains(Flags::RETAIN),
                topic_kind,
                topic_id,
                msg_id,
                payload: body[cursor..].to_vec(),
            })
        }
        types::PUBACK => Ok(Frame::Puback {
            topic_id: read_u16(body, &mut cursor)?,
            msg_id: read_u16(body, &mut cursor)?,
            return_code: ReturnCode::from_byte(read_u8(body, &mut cursor)?),
        }),
        types::PUBREC => Ok(Frame::Pubrec {
            msg_id: read_u16(body, &mut cursor)?,
        }),
        types::PUBREL => Ok(Frame::Pubrel {
            msg_id: read_u16(body, &mut cursor)?,
        }),
        types::PUBCOMP => Ok(Frame::Pubcomp {
            msg_id: read_u16(body, &mut cursor)?,
        }),
        types::SUBSCRIBE => {
            let (flags, qos, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let msg_id = read_u16(body, &mut cursor)?;
            let topic = parse_subscribe_topic(topic_kind, body, &mut cursor)?;
            Ok(Frame::Subscribe {
                dup: flags.contains(Flags::DUP),
                qos,
                msg_id,
                topic,
            })
        }
        types::SUBACK => {
            let (_, qos, _) = split_flags(read_u8(body, &mut cursor)?);
            Ok(Frame::Suback {
                qos,
                topic_id: read_u16(body, &mut cursor)?,
                msg_id: read_u16(body, &mut cursor)?,
                return_code: ReturnCode::from_byte(read_u8(body, &mut cursor)?),
            })
        }
        types::UNSUBSCRIBE => {
            let (_, _, topic_kind) = split_flags(read_u8(body, &mut cursor)?);
            let msg_id = read_u16(body, &mut cursor)?;
            let topic = parse_subscribe_topic(topic_kind, body, &mut cursor)?;
            Ok(Frame::Unsubscribe { msg_id, topic })
        }
        types::UNSUBACK => Ok(Frame::Unsuback {
            msg_id: read_u16(body, &mut cursor)?,
        }),
        types::PINGREQ => {
            let client_id = if body.is_empty() {
                None
            } else {
                let id = read_string(body, &mut cursor)?;
                check_client_id(&id)?;
                Some(id)
            };
            Ok(Frame::Pingreq { client_id })
        }
        types::PINGRESP => Ok(Frame::Pingresp),
        types::DISCONNECT => {
            let duration = if body.is_empty() {
                None
            } else {
                Some(read_u16(body, &mut cursor)?)
            };
            Ok(Frame::Disconnect { duration })
        }
        other => Err(CodecError::UnknownType(other)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connack_encodes_to_three_bytes() {
        let framed = encode(&Frame::Connack {
            return_code: ReturnCode::Accepted,
        })
        .unwrap();
        assert_eq!(framed, vec![3, types::CONNACK, 0]);
    }

    #[test]
    fn publish_flags_layout() {
        let framed = encode(&Frame::Publish {
            dup: true,
            qos: Qos::AtLeastOnce,
            retain: true,
            topic_kind: TopicIdKind::Predefined,
            topic_id: 7,
            msg_id: 9,
            payload: b"hi".to_vec(),
        })
        .unwrap();
        // DUP | QoS 1 | RETAIN | PREDEFINED
        assert_eq!(framed[2], 0x80 | 0x20 | 0x10 | 0x01);
        assert_eq!(&framed[3..5], &[0, 7]);
        assert_eq!(&framed[5..7], &[0, 9]);
        match decode(&framed).unwrap() {
            Frame::Publish {
                dup,
                qos,
                retain,
                topic_kind,
                topic_id,
                msg_id,
                payload,
            } => {
                assert!(dup);
                assert!(retain);
                assert_eq!(qos, Qos::AtLeastOnce);
                assert_eq!(topic_kind, TopicIdKind::Predefined);
                assert_eq!(topic_id, 7);
                assert_eq!(msg_id, 9);
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn qos_minus_one_survives_the_flags_octet() {
        let framed = encode(&Frame::Publish {
            dup: false,
            qos: Qos::MinusOne,
            retain: false,
            topic_kind: TopicIdKind::Short,
            topic_id: pack_short_topic("ab").unwrap(),
            msg_id: 0,
            payload: vec![1, 2, 3],
        })
        .unwrap();
        match decode(&framed).unwrap() {
            Frame::Publish { qos, .. } => assert_eq!(qos, Qos::MinusOne),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn subscribe_carries_normal_filter_as_string() {
        let framed = encode(&Frame::Subscribe {
            dup: false,
            qos: Qos::ExactlyOnce,
            msg_id: 3,
            topic: TopicTarget::Filter("sensors/+/temp".into()),
        })
        .unwrap();
        match decode(&framed).unwrap() {
            Frame::Subscribe {
                qos, msg_id, topic, ..
            } => {
                assert_eq!(qos, Qos::ExactlyOnce);
                assert_eq!(msg_id, 3);
                assert_eq!(topic, TopicTarget::Filter("sensors/+/temp".into()));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn connect_rejects_foreign_protocol_id() {
        let mut framed = encode(&Frame::Connect {
            client_id: "c1".into(),
            duration: 30,
            clean_session: true,
            will: false,
            session_expiry: None,
        })
        .unwrap();
        framed[3] = 0x7F;
        assert_eq!(
            decode(&framed),
            Err(CodecError::UnsupportedProtocol(0x7F))
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert_eq!(
            decode(&[4, types::PUBREC, 0]),
            Err(CodecError::LengthMismatch)
        );
        assert_eq!(decode(&[3, types::PUBREC, 0]), Err(CodecError::Truncated));
    }

    #[test]
    fn disconnect_duration_is_optional() {
        let framed = encode(&Frame::Disconnect { duration: None }).unwrap();
        assert_eq!(framed, vec![2, types::DISCONNECT]);
        let framed = encode(&Frame::Disconnect { duration: Some(60) }).unwrap();
        assert_eq!(decode(&framed).unwrap(), Frame::Disconnect { duration: Some(60) });
    }
}
