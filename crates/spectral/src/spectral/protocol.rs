use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Packet length prefix is capped at 2^21 - 1 bytes by the vanilla protocol.
pub const MAX_PACKET_LEN: i32 = (1 << 21) - 1;
/// Protocol strings carry at most 32767 characters.
pub const MAX_STRING_LEN: i32 = 32767;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const LOGIN_START_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("varint longer than 5 bytes")]
    VarIntTooLong,
    #[error("packet length {0} outside [1, {MAX_PACKET_LEN}]")]
    PacketLength(i32),
    #[error("string length {0} outside [0, {MAX_STRING_LEN}]")]
    StringLength(i32),
    #[error("string is not valid utf-8")]
    InvalidString,
    #[error("payload truncated")]
    Truncated,
    #[error("unexpected packet id {got:#04x}, wanted {want:#04x}")]
    UnexpectedPacket { got: i32, want: i32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded frame: packet id plus the remaining payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Serialize to the wire frame: `VarInt length || VarInt id || payload`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.data.len() + 5);
        put_varint(&mut body, self.id);
        body.extend_from_slice(&self.data);

        let mut out = Vec::with_capacity(body.len() + 3);
        put_varint(&mut out, body.len() as i32);
        out.extend_from_slice(&body);
        out
    }
}

pub fn put_varint(buf: &mut Vec<u8>, v: i32) {
    let mut v = v as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Sequential reader over a packet payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let b = self.read_u8()?;
            result |= ((b & 0x7f) as u32) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(CodecError::VarIntTooLong)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_varint()?;
        if !(0..=MAX_STRING_LEN).contains(&len) {
            return Err(CodecError::StringLength(len));
        }
        let len = len as usize;
        if self.pos + len > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .map_err(|_| CodecError::InvalidString)?;
        self.pos += len;
        Ok(s.to_string())
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        if self.pos + 8 > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Read one framed packet.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet, CodecError> {
    Ok(read_packet_raw(r).await?.0)
}

/// Read one framed packet, also returning the exact frame bytes as received.
///
/// The raw frame is what gets re-emitted towards the backend, so it must be
/// byte-identical to what the client sent.
pub async fn read_packet_raw<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(Packet, Vec<u8>), CodecError> {
    let mut raw = Vec::with_capacity(64);
    let len = read_varint_wire(r, &mut raw).await?;
    if !(1..=MAX_PACKET_LEN).contains(&len) {
        return Err(CodecError::PacketLength(len));
    }

    let start = raw.len();
    raw.resize(start + len as usize, 0);
    r.read_exact(&mut raw[start..]).await?;

    let mut payload = PayloadReader::new(&raw[start..]);
    let id = payload.read_varint()?;
    let data = payload.remaining().to_vec();
    Ok((Packet { id, data }, raw))
}

/// Decode a single frame already held in memory.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, CodecError> {
    let mut r = PayloadReader::new(frame);
    let len = r.read_varint()?;
    if !(1..=MAX_PACKET_LEN).contains(&len) {
        return Err(CodecError::PacketLength(len));
    }
    let body = r.remaining();
    if body.len() < len as usize {
        return Err(CodecError::Truncated);
    }
    let mut payload = PayloadReader::new(&body[..len as usize]);
    let id = payload.read_varint()?;
    Ok(Packet {
        id,
        data: payload.remaining().to_vec(),
    })
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    w: &mut W,
    packet: &Packet,
) -> Result<(), CodecError> {
    w.write_all(&packet.encode()).await?;
    Ok(())
}

async fn read_varint_wire<R: AsyncRead + Unpin>(
    r: &mut R,
    raw: &mut Vec<u8>,
) -> Result<i32, CodecError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let b = r.read_u8().await?;
        raw.push(b);
        result |= ((b & 0x7f) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(CodecError::VarIntTooLong)
}

/// The first packet of every connection: intended host, port and next state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn decode(packet: &Packet) -> Result<Self, CodecError> {
        if packet.id != HANDSHAKE_ID {
            return Err(CodecError::UnexpectedPacket {
                got: packet.id,
                want: HANDSHAKE_ID,
            });
        }
        let mut r = PayloadReader::new(&packet.data);
        Ok(Self {
            protocol_version: r.read_varint()?,
            server_address: r.read_string()?,
            server_port: r.read_u16()?,
            next_state: r.read_varint()?,
        })
    }

    /// Re-encoding a decoded handshake reproduces the original frame when the
    /// original was minimally varint-encoded.
    pub fn encode(&self) -> Packet {
        let mut data = Vec::with_capacity(self.server_address.len() + 16);
        put_varint(&mut data, self.protocol_version);
        put_string(&mut data, &self.server_address);
        data.extend_from_slice(&self.server_port.to_be_bytes());
        put_varint(&mut data, self.next_state);
        Packet::new(HANDSHAKE_ID, data)
    }
}

/// LoginStart carries the username first; trailing fields (profile UUID on
/// modern protocol versions) are ignored.
pub fn decode_login_start(packet: &Packet) -> Result<String, CodecError> {
    if packet.id != LOGIN_START_ID {
        return Err(CodecError::UnexpectedPacket {
            got: packet.id,
            want: LOGIN_START_ID,
        });
    }
    PayloadReader::new(&packet.data).read_string()
}

pub fn decode_ping(packet: &Packet) -> Result<i64, CodecError> {
    if packet.id != PING_ID {
        return Err(CodecError::UnexpectedPacket {
            got: packet.id,
            want: PING_ID,
        });
    }
    PayloadReader::new(&packet.data).read_i64()
}

pub fn ping_packet(payload: i64) -> Packet {
    Packet::new(PING_ID, payload.to_be_bytes().to_vec())
}

pub fn status_request_packet() -> Packet {
    Packet::new(STATUS_REQUEST_ID, Vec::new())
}

pub fn status_response_packet(json: &str) -> Packet {
    let mut data = Vec::with_capacity(json.len() + 5);
    put_string(&mut data, json);
    Packet::new(STATUS_RESPONSE_ID, data)
}

/// Disconnect reason is a Chat component; the codec only frames the JSON text.
pub fn disconnect_packet(reason_json: &str) -> Packet {
    let mut data = Vec::with_capacity(reason_json.len() + 5);
    put_string(&mut data, reason_json);
    Packet::new(LOGIN_DISCONNECT_ID, data)
}

/// A minimal server-list status used for configured default/offline responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleStatus {
    pub name: String,
    pub protocol: i32,
    pub description: String,
}

impl SimpleStatus {
    pub fn marshal(&self) -> Packet {
        let json = serde_json::json!({
            "version": { "name": self.name, "protocol": self.protocol },
            "players": { "online": 0, "max": 0, "sample": [] },
            "description": { "text": self.description },
        });
        status_response_packet(&json.to_string())
    }
}
