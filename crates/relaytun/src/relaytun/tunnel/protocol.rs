//! Relay frame codec.
//!
//! Every frame starts with a big-endian `u16` tag. Relay-originated frames use the
//! relay's message layouts; the two handshake requests are carried in band.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::relaytun::tunnel::target::Target;

pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;
pub const MAX_STRING_BYTES: usize = 16 * 1024;
/// Largest relay-originated frame: tag + length + one full data payload.
pub const MAX_FRAME_BYTES: usize = 2 + 4 + MAX_DATA_PAYLOAD;

const TAG_CONNECT_SUCCESS: u16 = 0x0001;
const TAG_RECONNECT_SUCCESS: u16 = 0x0002;
const TAG_DATA: u16 = 0x0004;
const TAG_ACK: u16 = 0x0007;
const TAG_CLOSE: u16 = 0x000a;
const TAG_CONNECT_REQUEST: u16 = 0x0081;
const TAG_RECONNECT_REQUEST: u16 = 0x0082;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame tag {0:#06x}")]
    UnknownTag(u16),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("empty data frame")]
    EmptyPayload,
    #[error("invalid string field: {0}")]
    InvalidString(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay close code, as sent in long-close frames or WebSocket close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u32);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const ERROR_UNKNOWN: CloseCode = CloseCode(4000);
    pub const SID_UNKNOWN: CloseCode = CloseCode(4001);
    pub const SID_IN_USE: CloseCode = CloseCode(4002);
    pub const FAILED_TO_CONNECT_TO_BACKEND: CloseCode = CloseCode(4003);
    pub const REAUTHENTICATION_REQUIRED: CloseCode = CloseCode(4004);
    pub const BAD_ACK: CloseCode = CloseCode(4005);
    pub const INVALID_ACK: CloseCode = CloseCode(4006);
    pub const INVALID_WEBSOCKET_OPCODE: CloseCode = CloseCode(4007);
    pub const INVALID_TAG: CloseCode = CloseCode(4008);
    pub const DESTINATION_WRITE_FAILED: CloseCode = CloseCode(4009);
    pub const DESTINATION_READ_FAILED: CloseCode = CloseCode(4010);
    pub const INVALID_DATA: CloseCode = CloseCode(4013);
    pub const NOT_AUTHORIZED: CloseCode = CloseCode(4033);
    pub const LOOKUP_FAILED: CloseCode = CloseCode(4047);
    pub const LOOKUP_FAILED_RECONNECT: CloseCode = CloseCode(4051);
    pub const FAILED_TO_REWIND: CloseCode = CloseCode(4074);

    pub fn name(self) -> Option<&'static str> {
        let n = match self {
            CloseCode::NORMAL => "normal",
            CloseCode::ERROR_UNKNOWN => "error_unknown",
            CloseCode::SID_UNKNOWN => "sid_unknown",
            CloseCode::SID_IN_USE => "sid_in_use",
            CloseCode::FAILED_TO_CONNECT_TO_BACKEND => "failed_to_connect_to_backend",
            CloseCode::REAUTHENTICATION_REQUIRED => "reauthentication_required",
            CloseCode::BAD_ACK => "bad_ack",
            CloseCode::INVALID_ACK => "invalid_ack",
            CloseCode::INVALID_WEBSOCKET_OPCODE => "invalid_websocket_opcode",
            CloseCode::INVALID_TAG => "invalid_tag",
            CloseCode::DESTINATION_WRITE_FAILED => "destination_write_failed",
            CloseCode::DESTINATION_READ_FAILED => "destination_read_failed",
            CloseCode::INVALID_DATA => "invalid_data",
            CloseCode::NOT_AUTHORIZED => "not_authorized",
            CloseCode::LOOKUP_FAILED => "lookup_failed",
            CloseCode::LOOKUP_FAILED_RECONNECT => "lookup_failed_reconnect",
            CloseCode::FAILED_TO_REWIND => "failed_to_rewind",
            _ => return None,
        };
        Some(n)
    }

    pub fn disposition(self) -> CloseDisposition {
        match self {
            CloseCode::NORMAL
            | CloseCode::DESTINATION_READ_FAILED
            | CloseCode::DESTINATION_WRITE_FAILED => CloseDisposition::Graceful,
            CloseCode::NOT_AUTHORIZED => CloseDisposition::Denied,
            CloseCode::SID_UNKNOWN | CloseCode::SID_IN_USE | CloseCode::FAILED_TO_REWIND => {
                CloseDisposition::SessionLost
            }
            CloseCode::FAILED_TO_CONNECT_TO_BACKEND => CloseDisposition::BackendUnreachable,
            CloseCode::LOOKUP_FAILED | CloseCode::LOOKUP_FAILED_RECONNECT => {
                CloseDisposition::NotFound
            }
            _ => CloseDisposition::Transient,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => write!(f, "{} ({n})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// How a relay close code affects the session that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// The far end finished; surface end-of-stream.
    Graceful,
    Denied,
    /// The relay no longer knows the session id.
    SessionLost,
    BackendUnreachable,
    NotFound,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest {
        target: Target,
        token: String,
    },
    ConnectSuccess {
        session_id: String,
    },
    ReconnectRequest {
        session_id: String,
        ack_offset: u64,
        bytes_received: u64,
    },
    ReconnectSuccess {
        ack_offset: u64,
    },
    Data(Bytes),
    Ack(u64),
    Close {
        code: CloseCode,
        reason: String,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ConnectRequest { .. } => "connect_request",
            Frame::ConnectSuccess { .. } => "connect_success",
            Frame::ReconnectRequest { .. } => "reconnect_request",
            Frame::ReconnectSuccess { .. } => "reconnect_success",
            Frame::Data(_) => "data",
            Frame::Ack(_) => "ack",
            Frame::Close { .. } => "close",
        }
    }
}

/// Stateless codec; decoding is resumable and consumes nothing until a whole frame is buffered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayCodec;

impl Encoder<Frame> for RelayCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match frame {
            Frame::ConnectRequest { target, token } => {
                dst.put_u16(TAG_CONNECT_REQUEST);
                put_str(dst, &target.project_id)?;
                put_str(dst, &target.zone)?;
                put_str(dst, &target.instance)?;
                put_str(dst, &target.interface)?;
                dst.put_u16(target.port);
                put_str(dst, &token)?;
            }
            Frame::ConnectSuccess { session_id } => {
                check_session_id(session_id.as_bytes())?;
                dst.put_u16(TAG_CONNECT_SUCCESS);
                put_str(dst, &session_id)?;
            }
            Frame::ReconnectRequest {
                session_id,
                ack_offset,
                bytes_received,
            } => {
                check_session_id(session_id.as_bytes())?;
                dst.put_u16(TAG_RECONNECT_REQUEST);
                put_str(dst, &session_id)?;
                dst.put_u64(ack_offset);
                dst.put_u64(bytes_received);
            }
            Frame::ReconnectSuccess { ack_offset } => {
                dst.put_u16(TAG_RECONNECT_SUCCESS);
                dst.put_u64(ack_offset);
            }
            Frame::Data(payload) => {
                if payload.is_empty() {
                    return Err(ProtocolError::EmptyPayload);
                }
                if payload.len() > MAX_DATA_PAYLOAD {
                    return Err(ProtocolError::PayloadTooLarge(len_u32(payload.len())));
                }
                dst.reserve(6 + payload.len());
                dst.put_u16(TAG_DATA);
                dst.put_u32(payload.len() as u32);
                dst.put_slice(&payload);
            }
            Frame::Ack(n) => {
                dst.put_u16(TAG_ACK);
                dst.put_u64(n);
            }
            Frame::Close { code, reason } => {
                dst.put_u16(TAG_CLOSE);
                dst.put_u32(code.0);
                put_str(dst, &reason)?;
            }
        }
        Ok(())
    }
}

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let mut r = Reader { buf: &src[..], pos: 0 };
        match parse_frame(&mut r) {
            Ok(frame) => {
                let used = r.pos;
                src.advance(used);
                Ok(Some(frame))
            }
            Err(Short::Incomplete) => {
                src.reserve(MAX_FRAME_BYTES.saturating_sub(src.len()).min(4096));
                Ok(None)
            }
            Err(Short::Invalid(err)) => Err(err),
        }
    }
}

/// Encodes a single frame into an owned buffer ready to hand to a link.
pub fn encode_frame(frame: Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    RelayCodec.encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

fn parse_frame(r: &mut Reader<'_>) -> Result<Frame, Short> {
    let tag = r.u16()?;
    let frame = match tag {
        TAG_CONNECT_SUCCESS => {
            let raw = r.bytes(MAX_STRING_BYTES)?;
            check_session_id(raw)?;
            Frame::ConnectSuccess {
                session_id: utf8(raw, "session id")?,
            }
        }
        TAG_RECONNECT_SUCCESS => Frame::ReconnectSuccess {
            ack_offset: r.u64()?,
        },
        TAG_DATA => {
            let n = r.u32()?;
            if n == 0 {
                return Err(ProtocolError::EmptyPayload.into());
            }
            if n as usize > MAX_DATA_PAYLOAD {
                return Err(ProtocolError::PayloadTooLarge(n).into());
            }
            Frame::Data(Bytes::copy_from_slice(r.take(n as usize)?))
        }
        TAG_ACK => Frame::Ack(r.u64()?),
        TAG_CLOSE => {
            let code = CloseCode(r.u32()?);
            let reason = utf8(r.bytes(MAX_STRING_BYTES)?, "close reason")?;
            Frame::Close { code, reason }
        }
        TAG_CONNECT_REQUEST => {
            let project_id = r.string("project")?;
            let zone = r.string("zone")?;
            let instance = r.string("instance")?;
            let interface = r.string("interface")?;
            let port = r.u16()?;
            let token = r.string("token")?;
            Frame::ConnectRequest {
                target: Target {
                    project_id,
                    zone,
                    instance,
                    port,
                    interface,
                },
                token,
            }
        }
        TAG_RECONNECT_REQUEST => {
            let raw = r.bytes(MAX_STRING_BYTES)?;
            check_session_id(raw)?;
            Frame::ReconnectRequest {
                session_id: utf8(raw, "session id")?,
                ack_offset: r.u64()?,
                bytes_received: r.u64()?,
            }
        }
        other => return Err(ProtocolError::UnknownTag(other).into()),
    };
    Ok(frame)
}

enum Short {
    Incomplete,
    Invalid(ProtocolError),
}

impl From<ProtocolError> for Short {
    fn from(err: ProtocolError) -> Self {
        Short::Invalid(err)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Short> {
        let end = self.pos.checked_add(n).ok_or(Short::Incomplete)?;
        if end > self.buf.len() {
            return Err(Short::Incomplete);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, Short> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Short> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, Short> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    /// Length-prefixed byte field; the length is checked before waiting for the body.
    fn bytes(&mut self, max: usize) -> Result<&'a [u8], Short> {
        let n = self.u32()?;
        if n as usize > max {
            return Err(ProtocolError::PayloadTooLarge(n).into());
        }
        self.take(n as usize)
    }

    fn string(&mut self, field: &'static str) -> Result<String, Short> {
        let raw = self.bytes(MAX_STRING_BYTES)?;
        utf8(raw, field)
    }
}

fn utf8(raw: &[u8], field: &'static str) -> Result<String, Short> {
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString(field).into())
}

fn check_session_id(raw: &[u8]) -> Result<(), ProtocolError> {
    if raw.is_empty() || !raw.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::InvalidString("session id"));
    }
    Ok(())
}

fn put_str(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len_u32(s.len())));
    }
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn len_u32(n: usize) -> u32 {
    n.try_into().unwrap_or(u32::MAX)
}
