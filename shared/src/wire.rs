//! Binary wire format shared by client and server.
//!
//! Every message starts with a 2-byte big-endian subject tag followed by the
//! subject's payload fields in a fixed order. Strings are length-prefixed
//! (u16) UTF-8, booleans are a single 0/1 byte, floats are big-endian IEEE754.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Decode failures for inbound payload bytes.
///
/// These are protocol errors: the envelope is logged and dropped, the worker
/// that hit them keeps running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload ended before the expected field")]
    UnexpectedEof,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("boolean field holds invalid byte {0:#04x}")]
    InvalidBool(u8),
    #[error("unknown subject tag {0}")]
    UnknownSubject(u16),
}

/// The typed kind of a message, used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Subject {
    /// Synthesized by the server endpoint when a peer connects.
    Connect = 0,
    /// Synthesized by the server endpoint when a peer drops.
    Disconnect = 1,
    LoginRequest = 2,
    LoginResponse = 3,
    LogOutRequest = 4,
    LogOutResponse = 5,
    ServerInfoRequest = 6,
    ServerInfoResponse = 7,
    /// Broadcast whenever a player's connected status changes.
    PlayerStatusUpdate = 8,
    /// Free-form server notice.
    ServerMessage = 9,
}

impl Subject {
    pub fn from_u16(raw: u16) -> Result<Subject, WireError> {
        match raw {
            0 => Ok(Subject::Connect),
            1 => Ok(Subject::Disconnect),
            2 => Ok(Subject::LoginRequest),
            3 => Ok(Subject::LoginResponse),
            4 => Ok(Subject::LogOutRequest),
            5 => Ok(Subject::LogOutResponse),
            6 => Ok(Subject::ServerInfoRequest),
            7 => Ok(Subject::ServerInfoResponse),
            8 => Ok(Subject::PlayerStatusUpdate),
            9 => Ok(Subject::ServerMessage),
            other => Err(WireError::UnknownSubject(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Append-only payload builder. Constructed for a subject so the leading tag
/// can never be forgotten or written twice.
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn for_subject(subject: Subject) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(subject.as_u16());
        PayloadWriter { buf }
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    /// Length-prefixed UTF-8. Wire strings are short identifiers and detail
    /// messages; the u16 prefix is a hard protocol limit, so longer input is
    /// truncated at the nearest char boundary below it.
    pub fn write_str(&mut self, value: &str) {
        let mut len = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(len) {
            len -= 1;
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&value.as_bytes()[..len]);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Positioned reader over a payload. Reads advance the position; a fresh
/// reader can be taken from the same immutable payload any number of times.
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(payload: Bytes) -> Self {
        PayloadReader { buf: payload }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, bytes: usize) -> Result<(), WireError> {
        if self.buf.remaining() < bytes {
            return Err(WireError::UnexpectedEof);
        }
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}
