use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 3 bytes payload length + 1 byte sequence id
pub const PACKET_HEADER_SIZE: usize = 4;

/// One frame of the MySQL client/server protocol
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a command packet: one command byte followed by its argument
    pub fn command(command: u8, arg: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(arg.len() + 1);
        buf.put_u8(command);
        buf.extend_from_slice(arg);
        Self::new(0, buf.freeze())
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(PACKET_HEADER_SIZE + len);
        dst.put_uint_le(len as u64, 3);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Returns None until a whole packet is buffered
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }
        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Some(Self {
            sequence_id,
            payload,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.payload.first() == Some(&0x00)
    }

    pub fn is_err(&self) -> bool {
        self.payload.first() == Some(&0xFF)
    }

    /// EOF marker (0xFE with a short payload; a longer one is a row)
    pub fn is_eof(&self) -> bool {
        self.payload.first() == Some(&0xFE) && self.payload.len() < 9
    }
}

/// Frames [`Packet`]s on a client stream
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, std::io::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        packet.encode(dst);
        Ok(())
    }
}

pub mod command {
    pub const QUIT: u8 = 0x01;
    pub const QUERY: u8 = 0x03;
    pub const PING: u8 = 0x0e;
}

/// Client capability flags we negotiate
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;

    /// DEPRECATE_EOF stays off so result sets always end with an EOF packet
    pub const CLIENT_DEFAULT: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}
