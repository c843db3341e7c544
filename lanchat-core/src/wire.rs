//! Framing: 1-byte opcode + type-specific payload.
//! Strings and chunks are u32 BE length + bytes; integers are u64 BE; booleans are one byte.

use crate::identity::PeerId;
use crate::protocol::{opcode, WireMessage};

const OPCODE_SIZE: usize = 1;
const LEN_SIZE: usize = 4;
const U64_SIZE: usize = 8;
/// Upper bound for any single length-prefixed field.
pub const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame.
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::with_capacity(OPCODE_SIZE + encoded_payload_hint(msg));
    out.push(msg.opcode());
    match msg {
        WireMessage::Chat(text) => put_bytes(&mut out, text.as_bytes())?,
        WireMessage::TransferRequest { name, size } => {
            put_bytes(&mut out, name.as_bytes())?;
            out.extend_from_slice(&size.to_be_bytes());
        }
        WireMessage::TransferResponse { accepted } | WireMessage::InviteResponse { accepted } => {
            out.push(u8::from(*accepted));
        }
        WireMessage::TransferChunk(data) => put_bytes(&mut out, data)?,
        WireMessage::EndSession => {}
        WireMessage::InviteRequest { peer_id, peer_name } => {
            put_bytes(&mut out, peer_id.as_str().as_bytes())?;
            put_bytes(&mut out, peer_name.as_bytes())?;
        }
        WireMessage::TransferComplete { name } | WireMessage::TransferAck { name } => {
            put_bytes(&mut out, name.as_bytes())?
        }
    }
    Ok(out)
}

fn encoded_payload_hint(msg: &WireMessage) -> usize {
    match msg {
        WireMessage::TransferChunk(data) => LEN_SIZE + data.len(),
        WireMessage::Chat(text) => LEN_SIZE + text.len(),
        _ => 64,
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), FrameEncodeError> {
    let len = u32::try_from(bytes.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FIELD_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the buffer holds only a prefix of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireMessage, usize), FrameDecodeError> {
    let mut r = FieldReader { bytes, pos: 0 };
    let op = r.u8()?;
    let msg = match op {
        opcode::CHAT => WireMessage::Chat(r.string()?),
        opcode::TRANSFER_REQUEST => {
            let name = r.string()?;
            let size = r.u64()?;
            WireMessage::TransferRequest { name, size }
        }
        opcode::TRANSFER_RESPONSE => WireMessage::TransferResponse {
            accepted: r.bool()?,
        },
        opcode::TRANSFER_CHUNK => WireMessage::TransferChunk(r.bytes()?.to_vec()),
        opcode::END_SESSION => WireMessage::EndSession,
        opcode::INVITE => {
            let peer_id = PeerId::new(r.string()?);
            let peer_name = r.string()?;
            WireMessage::InviteRequest { peer_id, peer_name }
        }
        opcode::INVITE_RESPONSE => WireMessage::InviteResponse {
            accepted: r.bool()?,
        },
        opcode::TRANSFER_COMPLETE => WireMessage::TransferComplete { name: r.string()? },
        opcode::TRANSFER_ACK => WireMessage::TransferAck { name: r.string()? },
        other => return Err(FrameDecodeError::UnknownOpcode(other)),
    };
    Ok((msg, r.pos))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("field too large")]
    TooLarge,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        let end = self.pos.checked_add(n).ok_or(FrameDecodeError::TooLarge)?;
        if self.bytes.len() < end {
            return Err(FrameDecodeError::NeedMore);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(OPCODE_SIZE)?[0])
    }

    fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        let raw = self.take(U64_SIZE)?;
        let mut buf = [0u8; U64_SIZE];
        buf.copy_from_slice(raw);
        Ok(u64::from_be_bytes(buf))
    }

    fn bool(&mut self) -> Result<bool, FrameDecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameDecodeError::InvalidBool(other)),
        }
    }

    fn bytes(&mut self) -> Result<&'a [u8], FrameDecodeError> {
        let raw = self.take(LEN_SIZE)?;
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if len > MAX_FIELD_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<String, FrameDecodeError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| FrameDecodeError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<WireMessage> {
        vec![
            WireMessage::Chat("hello, 世界".into()),
            WireMessage::TransferRequest {
                name: "notes.txt".into(),
                size: 24 * 1024,
            },
            WireMessage::TransferResponse { accepted: true },
            WireMessage::TransferResponse { accepted: false },
            WireMessage::TransferChunk(vec![7u8; 300]),
            WireMessage::end_of_stream(),
            WireMessage::EndSession,
            WireMessage::InviteRequest {
                peer_id: PeerId::new("a1b2"),
                peer_name: "Alice".into(),
            },
            WireMessage::InviteResponse { accepted: false },
            WireMessage::TransferComplete {
                name: "notes.txt".into(),
            },
            WireMessage::TransferAck {
                name: "notes.txt".into(),
            },
        ]
    }

    #[test]
    fn every_variant_roundtrips() {
        for msg in all_variants() {
            let frame = encode_frame(&msg).unwrap();
            assert_eq!(frame[0], msg.opcode());
            let (decoded, n) = decode_frame(&frame).unwrap();
            assert_eq!(n, frame.len());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn exact_layout_of_transfer_request() {
        let frame = encode_frame(&WireMessage::TransferRequest {
            name: "ab".into(),
            size: 0x0102,
        })
        .unwrap();
        assert_eq!(
            frame,
            vec![0x02, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0, 0, 0, 0x01, 0x02]
        );
    }

    #[test]
    fn terminator_is_opcode_plus_zero_length() {
        let frame = encode_frame(&WireMessage::end_of_stream()).unwrap();
        assert_eq!(frame, vec![0x04, 0, 0, 0, 0]);
    }

    #[test]
    fn partial_read_need_more() {
        let msg = WireMessage::TransferRequest {
            name: "photo.jpg".into(),
            size: 99,
        };
        let frame = encode_frame(&msg).unwrap();
        assert!(matches!(decode_frame(&[]), Err(FrameDecodeError::NeedMore)));
        for cut in 1..frame.len() {
            assert!(
                matches!(decode_frame(&frame[..cut]), Err(FrameDecodeError::NeedMore)),
                "prefix of {cut} bytes should need more"
            );
        }
    }

    #[test]
    fn multiple_messages() {
        let a = WireMessage::Chat("one".into());
        let b = WireMessage::EndSession;
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        assert!(matches!(
            decode_frame(&[0x7f, 1, 2, 3]),
            Err(FrameDecodeError::UnknownOpcode(0x7f))
        ));
        assert!(matches!(
            decode_frame(&[0x00]),
            Err(FrameDecodeError::UnknownOpcode(0x00))
        ));
    }

    #[test]
    fn invalid_bool_and_utf8_rejected() {
        assert!(matches!(
            decode_frame(&[0x03, 2]),
            Err(FrameDecodeError::InvalidBool(2))
        ));
        assert!(matches!(
            decode_frame(&[0x01, 0, 0, 0, 2, 0xff, 0xfe]),
            Err(FrameDecodeError::InvalidUtf8)
        ));
    }

    #[test]
    fn oversized_length_rejected_without_buffering() {
        let len = (MAX_FIELD_LEN + 1).to_be_bytes();
        let frame = [0x04, len[0], len[1], len[2], len[3]];
        assert!(matches!(decode_frame(&frame), Err(FrameDecodeError::TooLarge)));
    }
}
