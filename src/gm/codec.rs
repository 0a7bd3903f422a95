use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 4 bytes big-endian body length + 1 byte frame kind
pub const FRAME_HEADER_SIZE: usize = 5;
/// Refuse frames larger than this (the body is one JSON detection result)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const KIND_ACK: u8 = 0;
const KIND_NACK: u8 = 1;
const KIND_REPORT: u8 = 2;

/// Agent <-> coordination node frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `detect_type\0payload`
    Report { detect_type: String, payload: Bytes },
    Ack,
    /// Node refused the report; body is the reason
    Nack(String),
}

/// Length-prefixed frame codec for use with tokio Framed
#[derive(Debug, Default)]
pub struct ReportCodec;

impl Decoder for ReportCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {} bytes exceeds limit", len)));
        }
        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let kind = src[4];
        src.advance(FRAME_HEADER_SIZE);
        let body = src.split_to(len).freeze();

        let frame = match kind {
            KIND_ACK => Frame::Ack,
            KIND_NACK => Frame::Nack(String::from_utf8_lossy(&body).to_string()),
            KIND_REPORT => {
                let nul = body
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| invalid("report frame without detect type".into()))?;
                Frame::Report {
                    detect_type: String::from_utf8_lossy(&body[..nul]).to_string(),
                    payload: body.slice(nul + 1..),
                }
            }
            other => return Err(invalid(format!("unknown frame kind {}", other))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for ReportCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, body) = match item {
            Frame::Ack => (KIND_ACK, Bytes::new()),
            Frame::Nack(reason) => (KIND_NACK, Bytes::from(reason.into_bytes())),
            Frame::Report {
                detect_type,
                payload,
            } => {
                let mut body = BytesMut::with_capacity(detect_type.len() + 1 + payload.len());
                body.extend_from_slice(detect_type.as_bytes());
                body.put_u8(0);
                body.extend_from_slice(&payload);
                (KIND_REPORT, body.freeze())
            }
        };
        if body.len() > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {} bytes exceeds limit", body.len())));
        }
        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_u8(kind);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
