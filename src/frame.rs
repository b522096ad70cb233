//! Gateway frame schema and codec.
//!
//! Frames are JSON objects `{ "op", "d", "s", "t" }`. Text messages carry plain JSON; binary
//! messages carry zlib-compressed JSON.

use std::fmt;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConnectionProperties, SessionConfig};
use crate::error::ProtocolFault;
use crate::transport::Inbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    StatusUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolFault;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::StatusUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            other => return Err(ProtocolFault::UnknownOpcode(other)),
        })
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::StatusUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
        }
    }
}

/// A decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: OpCode,
    pub data: Value,
    /// Sequence number; only dispatch frames carry one.
    pub sequence: Option<u64>,
    /// Event name; only dispatch frames carry one.
    pub event: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
}

impl Frame {
    pub fn new(op: OpCode, data: Value) -> Self {
        Self { op, data, sequence: None, event: None }
    }

    /// Build a dispatch frame.
    pub fn dispatch(event: &str, sequence: u64, data: Value) -> Self {
        Self { op: OpCode::Dispatch, data, sequence: Some(sequence), event: Some(event.to_owned()) }
    }

    pub fn decode(message: &Inbound) -> Option<Result<Self, ProtocolFault>> {
        match message {
            Inbound::Text(text) => Some(Self::decode_text(text)),
            Inbound::Binary(bytes) => Some(Self::decode_binary(bytes)),
            Inbound::Closed { .. } => None,
        }
    }

    pub fn decode_text(text: &str) -> Result<Self, ProtocolFault> {
        let wire: WireFrame =
            serde_json::from_str(text).map_err(|e| ProtocolFault::Json(e.to_string()))?;
        Ok(Self {
            op: OpCode::try_from(wire.op)?,
            data: wire.d,
            sequence: wire.s,
            event: wire.t,
        })
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolFault> {
        let mut text = String::new();
        ZlibDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|e| ProtocolFault::Decompress(e.to_string()))?;
        Self::decode_text(&text)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolFault> {
        let wire = WireFrame {
            op: self.op.into(),
            d: self.data.clone(),
            s: self.sequence,
            t: self.event.clone(),
        };
        serde_json::to_vec(&wire).map_err(|e| ProtocolFault::Json(e.to_string()))
    }

    /// Deserialize the payload into `T`.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolFault> {
        T::deserialize(&self.data).map_err(|e| ProtocolFault::Json(e.to_string()))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.event, self.sequence) {
            (Some(event), Some(seq)) => write!(f, "{:?}({} #{})", self.op, event, seq),
            (Some(event), None) => write!(f, "{:?}({})", self.op, event),
            _ => write!(f, "{:?}", self.op),
        }
    }
}

/// Payload of the initial handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

/// Payload of the `READY` dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ready {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifyProperties<'a> {
    #[serde(rename = "$os")]
    os: &'a str,
    #[serde(rename = "$browser")]
    browser: &'a str,
    #[serde(rename = "$device")]
    device: &'a str,
}

impl<'a> From<&'a ConnectionProperties> for IdentifyProperties<'a> {
    fn from(p: &'a ConnectionProperties) -> Self {
        Self { os: &p.os, browser: &p.browser, device: &p.device }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Identify<'a> {
    token: &'a str,
    properties: IdentifyProperties<'a>,
    compress: bool,
    large_threshold: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    shard: Option<[u16; 2]>,
}

#[derive(Debug, Clone, Serialize)]
struct Resume<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

/// Game shown in a presence update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
struct StatusUpdate<'a> {
    idle_since: Option<u64>,
    game: Option<&'a Game>,
}

#[derive(Debug, Clone, Serialize)]
struct RequestMembers<'a> {
    #[serde(rename = "guild_id")]
    owners: Vec<String>,
    query: &'a str,
    limit: u32,
}

fn to_value<T: Serialize>(payload: T) -> Value {
    // plain structs of strings and numbers always serialize
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Identify frame opening a brand-new session.
pub fn identify(config: &SessionConfig) -> Frame {
    Frame::new(
        OpCode::Identify,
        to_value(Identify {
            token: config.token(),
            properties: config.properties().into(),
            compress: config.compress(),
            large_threshold: config.large_threshold(),
            shard: config.shard(),
        }),
    )
}

/// Resume frame re-attaching to `session_id` after `seq`.
pub fn resume(config: &SessionConfig, session_id: &str, seq: u64) -> Frame {
    Frame::new(
        OpCode::Resume,
        to_value(Resume { token: config.token(), session_id, seq }),
    )
}

pub fn heartbeat(last_sequence: Option<u64>) -> Frame {
    Frame::new(OpCode::Heartbeat, to_value(last_sequence))
}

pub fn status_update(idle_since: Option<u64>, game: Option<&Game>) -> Frame {
    Frame::new(OpCode::StatusUpdate, to_value(StatusUpdate { idle_since, game }))
}

pub fn request_members(owners: &[u64], query: &str, limit: u32) -> Frame {
    let owners = owners.iter().map(u64::to_string).collect();
    Frame::new(OpCode::RequestGuildMembers, to_value(RequestMembers { owners, query, limit }))
}
