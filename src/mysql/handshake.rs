use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet};

const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Initial handshake sent by the server right after TCP connect
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    /// 20-byte scramble used for `mysql_native_password`
    pub scramble: Vec<u8>,
    pub auth_plugin_name: String,
}

impl ServerGreeting {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }
        let mut buf = payload;

        let _protocol_version = buf.get_u8();
        let nul = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..nul]).to_string();
        buf.advance(nul + 1);

        if buf.remaining() < 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 {
            return None;
        }
        let connection_id = buf.get_u32_le();
        let mut scramble = buf[..8].to_vec();
        buf.advance(8 + 1);

        let lower = buf.get_u16_le() as u32;
        let _charset = buf.get_u8();
        let _status = buf.get_u16_le();
        let upper = buf.get_u16_le() as u32;
        let capability_flags = lower | (upper << 16);
        let scramble_len = buf.get_u8() as usize;
        buf.advance(10);

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = std::cmp::max(13, scramble_len.saturating_sub(8));
            let take = part2_len.min(buf.remaining());
            let data = &buf[..take];
            let end = data.iter().position(|&b| b == 0).unwrap_or(take);
            scramble.extend_from_slice(&data[..end]);
            buf.advance(take);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            server_version,
            connection_id,
            capability_flags,
            scramble,
            auth_plugin_name,
        })
    }
}

/// Client login packet answering a [`ServerGreeting`]
#[derive(Debug, Clone)]
pub struct LoginRequest<'a> {
    pub capability_flags: u32,
    pub username: &'a str,
    pub auth_response: Vec<u8>,
    pub database: Option<&'a str>,
}

impl<'a> LoginRequest<'a> {
    pub fn new(
        greeting: &ServerGreeting,
        username: &'a str,
        password: &str,
        database: Option<&'a str>,
    ) -> Self {
        let mut capability_flags = CLIENT_DEFAULT & greeting.capability_flags;
        if database.is_some() {
            capability_flags |= CLIENT_CONNECT_WITH_DB;
        }
        Self {
            capability_flags,
            username,
            auth_response: scramble_native_password(password, &greeting.scramble),
            database,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(16 * 1024 * 1024);
        buf.put_u8(0x21); // utf8_general_ci
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            buf.extend_from_slice(self.database.unwrap_or_default().as_bytes());
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`
pub fn scramble_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Server error reply
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 3 || payload[0] != 0xFF {
            return None;
        }
        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if buf.len() >= 6 && buf[0] == b'#' {
            (
                String::from_utf8_lossy(&buf[1..6]).to_string(),
                String::from_utf8_lossy(&buf[6..]).to_string(),
            )
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// 1045 ER_ACCESS_DENIED_ERROR, 1044 ER_DBACCESS_DENIED_ERROR
    pub fn is_access_denied(&self) -> bool {
        matches!(self.error_code, 1044 | 1045)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_payload() -> Vec<u8> {
        let caps = CLIENT_DEFAULT | CLIENT_CONNECT_WITH_DB;
        let mut buf = BytesMut::new();
        buf.put_u8(10);
        buf.extend_from_slice(b"5.7.20-tdbctl\0");
        buf.put_u32_le(42);
        buf.extend_from_slice(b"abcdefgh");
        buf.put_u8(0);
        buf.put_u16_le((caps & 0xFFFF) as u16);
        buf.put_u8(0x21);
        buf.put_u16_le(0x0002);
        buf.put_u16_le((caps >> 16) as u16);
        buf.put_u8(21);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(b"ijklmnopqrst\0");
        buf.extend_from_slice(b"mysql_native_password\0");
        buf.to_vec()
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = ServerGreeting::parse(&greeting_payload()).unwrap();
        assert_eq!(greeting.server_version, "5.7.20-tdbctl");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.scramble, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(greeting.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_parse_truncated_greeting() {
        assert!(ServerGreeting::parse(&greeting_payload()[..20]).is_none());
    }

    #[test]
    fn test_scramble_empty_password() {
        assert!(scramble_native_password("", b"01234567890123456789").is_empty());
        assert_eq!(
            scramble_native_password("secret", b"01234567890123456789").len(),
            20
        );
    }

    #[test]
    fn test_login_request_layout() {
        let greeting = ServerGreeting::parse(&greeting_payload()).unwrap();
        let login = LoginRequest::new(&greeting, "dbha", "secret", None);
        let packet = login.encode(1);
        assert_eq!(packet.sequence_id, 1);
        // 4 caps + 4 max packet + 1 charset + 23 reserved, then the username
        assert_eq!(&packet.payload[32..37], b"dbha\0");
        assert_eq!(login.capability_flags & CLIENT_CONNECT_WITH_DB, 0);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1045u16.to_le_bytes());
        payload.extend_from_slice(b"#28000Access denied for user");
        let err = ErrPacket::parse(&payload).unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied for user");
        assert!(err.is_access_denied());
    }
}
