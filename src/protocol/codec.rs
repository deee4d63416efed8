//! Frame codec
//!
//! Wire layout, little-endian:
//!
//! ```text
//! [length: u32][message_type_id: u16][sequence_number: u32][payload]
//! ```
//!
//! `length` counts the whole frame including the header. The codec is pure and
//! knows nothing about pending requests.

use crate::error::CodecError;
use crate::protocol::{Ack, InboundMessage, MessageKind, Request, SequenceNumber};

pub const HEADER_LEN: usize = 10;

/// Size of the acked sequence number that leads every ack payload.
const ACK_SEQ_LEN: usize = 4;

/// A decoded but untyped frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind_id: u16,
    pub seq: SequenceNumber,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> Result<MessageKind, CodecError> {
        MessageKind::try_from(self.kind_id)
    }
}

pub fn encode(kind_id: u16, seq: SequenceNumber, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&kind_id.to_le_bytes());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_request(seq: SequenceNumber, request: &Request) -> Vec<u8> {
    encode(request.kind().id(), seq, &request.payload())
}

/// Encodes a device-side message. Used by the loopback device.
pub fn encode_inbound(seq: SequenceNumber, message: &InboundMessage) -> Vec<u8> {
    match message {
        InboundMessage::Ack(Ack::Plain { seq: acked }) => {
            encode(MessageKind::Ack.id(), seq, &acked.to_le_bytes())
        }
        InboundMessage::Ack(Ack::I32 { seq: acked, value }) => {
            let mut payload = acked.to_le_bytes().to_vec();
            payload.extend_from_slice(&value.to_le_bytes());
            encode(MessageKind::AckI32.id(), seq, &payload)
        }
        InboundMessage::Ack(Ack::Data { seq: acked, data }) => {
            let mut payload = acked.to_le_bytes().to_vec();
            payload.extend_from_slice(data);
            encode(MessageKind::AckData.id(), seq, &payload)
        }
        InboundMessage::Info(text) => encode(MessageKind::Info.id(), seq, text.as_bytes()),
    }
}

/// Splits one received frame into header and payload.
///
/// The declared length must equal the number of bytes received.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let declared = read_u32(bytes, 0) as usize;
    if declared != bytes.len() || declared < HEADER_LEN {
        return Err(CodecError::MalformedFrame {
            declared,
            received: bytes.len(),
        });
    }
    Ok(Frame {
        kind_id: u16::from_le_bytes([bytes[4], bytes[5]]),
        seq: read_u32(bytes, 6),
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

pub fn decode_inbound(bytes: &[u8]) -> Result<InboundMessage, CodecError> {
    let frame = decode(bytes)?;
    let kind = frame.kind()?;
    let payload = frame.payload.as_slice();
    match kind {
        MessageKind::Ack => {
            expect_len(kind, payload, ACK_SEQ_LEN)?;
            Ok(InboundMessage::Ack(Ack::Plain {
                seq: read_u32(payload, 0),
            }))
        }
        MessageKind::AckI32 => {
            expect_len(kind, payload, ACK_SEQ_LEN + 4)?;
            Ok(InboundMessage::Ack(Ack::I32 {
                seq: read_u32(payload, 0),
                value: read_u32(payload, 4),
            }))
        }
        MessageKind::AckData => {
            if payload.len() < ACK_SEQ_LEN {
                return Err(CodecError::InvalidPayload {
                    kind: kind.name(),
                    expected: ACK_SEQ_LEN,
                    actual: payload.len(),
                });
            }
            Ok(InboundMessage::Ack(Ack::Data {
                seq: read_u32(payload, 0),
                data: payload[ACK_SEQ_LEN..].to_vec(),
            }))
        }
        MessageKind::Info => Ok(InboundMessage::Info(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        MessageKind::RequestStatus
        | MessageKind::GetColors
        | MessageKind::SetColors
        | MessageKind::ControllerState => Err(CodecError::UnknownMessageType(frame.kind_id)),
    }
}

/// Sequence number an ack frame refers to, even when the rest of its payload
/// does not fit the ack's schema.
pub fn acked_seq(bytes: &[u8]) -> Option<SequenceNumber> {
    let frame = decode(bytes).ok()?;
    match frame.kind().ok()? {
        MessageKind::Ack | MessageKind::AckI32 | MessageKind::AckData
            if frame.payload.len() >= ACK_SEQ_LEN =>
        {
            Some(read_u32(&frame.payload, 0))
        }
        _ => None,
    }
}

fn expect_len(kind: MessageKind, payload: &[u8], expected: usize) -> Result<(), CodecError> {
    if payload.len() != expected {
        return Err(CodecError::InvalidPayload {
            kind: kind.name(),
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControllerReport, ControllerType};

    #[test]
    fn header_is_bit_exact() {
        let bytes = encode_request(0x0102_0304, &Request::RequestStatus);
        assert_eq!(bytes, vec![10, 0, 0, 0, 0x40, 0x00, 0x04, 0x03, 0x02, 0x01]);

        let bytes = encode_request(
            7,
            &Request::GetColors {
                controller: ControllerType::LeftJoycon,
            },
        );
        assert_eq!(bytes.len(), 11);
        assert_eq!(&bytes[0..4], &11u32.to_le_bytes());
        assert_eq!(bytes[10], 2);
    }

    #[test]
    fn request_frames_decode_back_to_their_header() {
        let request = Request::ControllerState {
            ticks: 255,
            active: false,
            report: ControllerReport::neutral(),
        };
        let frame = decode(&encode_request(42, &request)).unwrap();
        assert_eq!(frame.kind(), Ok(MessageKind::ControllerState));
        assert_eq!(frame.seq, 42);
        assert_eq!(frame.payload, request.payload());
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let mut bytes = encode_inbound(1, &InboundMessage::Ack(Ack::Plain { seq: 9 }));
        bytes.push(0xff);
        assert_eq!(
            decode_inbound(&bytes),
            Err(CodecError::MalformedFrame {
                declared: 14,
                received: 15
            })
        );

        let short = &encode_inbound(1, &InboundMessage::Ack(Ack::Plain { seq: 9 }))[..12];
        assert!(matches!(
            decode_inbound(short),
            Err(CodecError::MalformedFrame { .. })
        ));
        assert_eq!(decode_inbound(&[1, 2, 3]), Err(CodecError::Truncated(3)));
    }

    #[test]
    fn inbound_acks_carry_the_acked_sequence_number() {
        let ack = InboundMessage::Ack(Ack::I32 {
            seq: 77,
            value: 0b11,
        });
        assert_eq!(decode_inbound(&encode_inbound(5, &ack)), Ok(ack));

        let data = InboundMessage::Ack(Ack::Data {
            seq: 78,
            data: vec![1, 2, 3],
        });
        assert_eq!(decode_inbound(&encode_inbound(6, &data)), Ok(data));

        let info = InboundMessage::Info("booted".into());
        assert_eq!(decode_inbound(&encode_inbound(7, &info)), Ok(info));
    }

    #[test]
    fn request_kinds_are_not_valid_inbound() {
        let bytes = encode_request(1, &Request::RequestStatus);
        assert_eq!(
            decode_inbound(&bytes),
            Err(CodecError::UnknownMessageType(0x0040))
        );
        let bytes = encode(0x0999, 1, &[]);
        assert_eq!(
            decode_inbound(&bytes),
            Err(CodecError::UnknownMessageType(0x0999))
        );
    }

    #[test]
    fn plain_ack_with_wrong_payload_size_is_rejected() {
        let bytes = encode(MessageKind::Ack.id(), 1, &[1, 2]);
        assert_eq!(
            decode_inbound(&bytes),
            Err(CodecError::InvalidPayload {
                kind: "ack",
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn wrong_size_acks_still_name_their_request() {
        let mut payload = 31u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[1, 2]);
        let bytes = encode(MessageKind::AckI32.id(), 1, &payload);
        assert!(decode_inbound(&bytes).is_err());
        assert_eq!(acked_seq(&bytes), Some(31));

        assert_eq!(acked_seq(&encode(MessageKind::Ack.id(), 1, &[1, 2])), None);
        assert_eq!(acked_seq(&encode(MessageKind::Info.id(), 1, &[0; 8])), None);
        assert_eq!(acked_seq(&[0xde, 0xad]), None);
    }
}
