//! Typed payloads and the inbound/outbound envelopes that move through the
//! endpoint pipeline.

use bytes::Bytes;

use crate::transport::{ChannelKind, ConnectionId, SocketId};
use crate::wire::{PayloadReader, PayloadWriter, Subject, WireError};

/// Outbound delivery mode: one target connection, or every connection the
/// session authority currently counts as connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reply(ConnectionId),
    Broadcast,
}

/// One encoded unit of outbound data. Immutable once constructed; ownership
/// moves from the producing handler into the queue and out to the sender.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub delivery: Delivery,
    pub channel: ChannelKind,
}

impl OutboundMessage {
    pub fn reply(payload: Bytes, connection: ConnectionId) -> Self {
        OutboundMessage {
            payload,
            delivery: Delivery::Reply(connection),
            channel: ChannelKind::Reliable,
        }
    }

    pub fn broadcast(payload: Bytes) -> Self {
        OutboundMessage {
            payload,
            delivery: Delivery::Broadcast,
            channel: ChannelKind::Reliable,
        }
    }

    pub fn on_channel(mut self, channel: ChannelKind) -> Self {
        self.channel = channel;
        self
    }
}

/// One decoded unit of inbound data with its routing metadata. The payload
/// excludes the subject tag; every handler gets its own positioned reader.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: ConnectionId,
    pub host_id: SocketId,
    pub channel: ChannelKind,
    pub subject: Subject,
    payload: Bytes,
    pub received_time: f32,
}

impl InboundMessage {
    pub fn new(
        connection_id: ConnectionId,
        host_id: SocketId,
        channel: ChannelKind,
        subject: Subject,
        payload: Bytes,
        received_time: f32,
    ) -> Self {
        InboundMessage {
            connection_id,
            host_id,
            channel,
            subject,
            payload,
            received_time,
        }
    }

    /// Envelope synthesized by the endpoint itself (connect/disconnect).
    pub fn control(
        connection_id: ConnectionId,
        host_id: SocketId,
        subject: Subject,
        received_time: f32,
    ) -> Self {
        Self::new(
            connection_id,
            host_id,
            ChannelKind::Reliable,
            subject,
            Bytes::new(),
            received_time,
        )
    }

    pub fn payload_reader(&self) -> PayloadReader {
        PayloadReader::new(self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub user_id: String,
}

impl LoginRequest {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::LoginRequest);
        writer.write_str(&self.user_id);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(LoginRequest {
            user_id: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub detail: String,
    pub server_time: f32,
}

impl LoginResponse {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::LoginResponse);
        writer.write_bool(self.success);
        writer.write_str(&self.token);
        writer.write_str(&self.detail);
        writer.write_f32(self.server_time);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(LoginResponse {
            success: reader.read_bool()?,
            token: reader.read_string()?,
            detail: reader.read_string()?,
            server_time: reader.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOutRequest {
    pub token: String,
}

impl LogOutRequest {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::LogOutRequest);
        writer.write_str(&self.token);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(LogOutRequest {
            token: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogOutResponse {
    pub success: bool,
    pub detail: String,
    pub server_time: f32,
}

impl LogOutResponse {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::LogOutResponse);
        writer.write_bool(self.success);
        writer.write_str(&self.detail);
        writer.write_f32(self.server_time);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(LogOutResponse {
            success: reader.read_bool()?,
            detail: reader.read_string()?,
            server_time: reader.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfoRequest {
    pub token: String,
}

impl ServerInfoRequest {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::ServerInfoRequest);
        writer.write_str(&self.token);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(ServerInfoRequest {
            token: reader.read_string()?,
        })
    }
}

/// Roster reply. The user count and names are only present on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfoResponse {
    pub success: bool,
    pub server_time: f32,
    pub detail: String,
    pub user_names: Vec<String>,
}

impl ServerInfoResponse {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::ServerInfoResponse);
        writer.write_bool(self.success);
        writer.write_f32(self.server_time);
        writer.write_str(&self.detail);
        if self.success {
            debug_assert!(self.user_names.len() <= u16::MAX as usize);
            writer.write_u16(self.user_names.len() as u16);
            for name in &self.user_names {
                writer.write_str(name);
            }
        } else {
            writer.write_u16(0);
        }
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        let success = reader.read_bool()?;
        let server_time = reader.read_f32()?;
        let detail = reader.read_string()?;
        let count = reader.read_u16()? as usize;
        let mut user_names = Vec::with_capacity(count);
        for _ in 0..count {
            user_names.push(reader.read_string()?);
        }
        Ok(ServerInfoResponse {
            success,
            server_time,
            detail,
            user_names,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatusUpdate {
    pub user_name: String,
    pub connected: bool,
    pub server_time: f32,
}

impl PlayerStatusUpdate {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::PlayerStatusUpdate);
        writer.write_str(&self.user_name);
        writer.write_bool(self.connected);
        writer.write_f32(self.server_time);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(PlayerStatusUpdate {
            user_name: reader.read_string()?,
            connected: reader.read_bool()?,
            server_time: reader.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNotice {
    pub text: String,
}

impl ServerNotice {
    pub fn encode(&self) -> Bytes {
        let mut writer = PayloadWriter::for_subject(Subject::ServerMessage);
        writer.write_str(&self.text);
        writer.finish()
    }

    pub fn decode(reader: &mut PayloadReader) -> Result<Self, WireError> {
        Ok(ServerNotice {
            text: reader.read_string()?,
        })
    }
}
