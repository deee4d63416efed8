//! Device protocol: message kinds, outbound requests and inbound replies
//!
//! The message set is closed. Decoding matches exhaustively on [`MessageKind`];
//! the only open mapping is the diagnostic [`registry::MessageRegistry`].
//!
//! ```text
//! Request ──► codec::encode_request ──► [length|type|seq|payload] ──► Transport
//! Transport ──► codec::decode_inbound ──► InboundMessage::{Ack, Info}
//! ```

pub mod codec;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, SessionError};

/// Per-connection request counter. Wraps at `u32::MAX`.
pub type SequenceNumber = u32;

/// Message type ids as they appear on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ack = 0x0001,
    AckI32 = 0x0002,
    AckData = 0x0003,
    Info = 0x0010,
    RequestStatus = 0x0040,
    GetColors = 0x0041,
    SetColors = 0x0042,
    ControllerState = 0x0050,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Ack,
        MessageKind::AckI32,
        MessageKind::AckData,
        MessageKind::Info,
        MessageKind::RequestStatus,
        MessageKind::GetColors,
        MessageKind::SetColors,
        MessageKind::ControllerState,
    ];

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ack => "ack",
            MessageKind::AckI32 => "ack_i32",
            MessageKind::AckData => "ack_data",
            MessageKind::Info => "info",
            MessageKind::RequestStatus => "request_status",
            MessageKind::GetColors => "get_colors",
            MessageKind::SetColors => "set_colors",
            MessageKind::ControllerState => "controller_state",
        }
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = CodecError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or(CodecError::UnknownMessageType(id))
    }
}

/// Emulated controller flavour, sent with the colour query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerType {
    WiredProController,
    #[default]
    WirelessProController,
    LeftJoycon,
    RightJoycon,
}

impl ControllerType {
    pub fn code(self) -> u8 {
        match self {
            ControllerType::WiredProController => 0,
            ControllerType::WirelessProController => 1,
            ControllerType::LeftJoycon => 2,
            ControllerType::RightJoycon => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControllerType::WiredProController),
            1 => Some(ControllerType::WirelessProController),
            2 => Some(ControllerType::LeftJoycon),
            3 => Some(ControllerType::RightJoycon),
            _ => None,
        }
    }
}

/// Body, button and grip colours reported by the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerColors {
    pub body: [u8; 3],
    pub buttons: [u8; 3],
    pub left_grip: [u8; 3],
    pub right_grip: [u8; 3],
}

impl ControllerColors {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..3].copy_from_slice(&self.body);
        out[3..6].copy_from_slice(&self.buttons);
        out[6..9].copy_from_slice(&self.left_grip);
        out[9..12].copy_from_slice(&self.right_grip);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::SIZE {
            return Err(CodecError::InvalidPayload {
                kind: "controller_colors",
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let rgb = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2]];
        Ok(Self {
            body: rgb(0),
            buttons: rgb(3),
            left_grip: rgb(6),
            right_grip: rgb(9),
        })
    }
}

/// Raw button/stick snapshot as the device expects it.
///
/// Layout: `[buttons u16 LE][dpad u8][lx][ly][rx][ry]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerReport {
    pub buttons: u16,
    pub dpad: u8,
    pub left_x: u8,
    pub left_y: u8,
    pub right_x: u8,
    pub right_y: u8,
}

impl ControllerReport {
    pub const SIZE: usize = 7;
    pub const DPAD_CENTER: u8 = 8;
    pub const STICK_CENTER: u8 = 0x80;

    pub fn neutral() -> Self {
        Self {
            buttons: 0,
            dpad: Self::DPAD_CENTER,
            left_x: Self::STICK_CENTER,
            left_y: Self::STICK_CENTER,
            right_x: Self::STICK_CENTER,
            right_y: Self::STICK_CENTER,
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::neutral()
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let buttons = self.buttons.to_le_bytes();
        [
            buttons[0],
            buttons[1],
            self.dpad,
            self.left_x,
            self.left_y,
            self.right_x,
            self.right_y,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::SIZE {
            return Err(CodecError::InvalidPayload {
                kind: "controller_report",
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            buttons: u16::from_le_bytes([bytes[0], bytes[1]]),
            dpad: bytes[2],
            left_x: bytes[3],
            left_y: bytes[4],
            right_x: bytes[5],
            right_y: bytes[6],
        })
    }
}

impl Default for ControllerReport {
    fn default() -> Self {
        Self::neutral()
    }
}

/// An outbound command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RequestStatus,
    GetColors {
        controller: ControllerType,
    },
    SetColors {
        controller: ControllerType,
        colors: ControllerColors,
    },
    /// At most 255 ticks of continuous state.
    ControllerState {
        ticks: u8,
        active: bool,
        report: ControllerReport,
    },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::RequestStatus => MessageKind::RequestStatus,
            Request::GetColors { .. } => MessageKind::GetColors,
            Request::SetColors { .. } => MessageKind::SetColors,
            Request::ControllerState { .. } => MessageKind::ControllerState,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Request::RequestStatus => Vec::new(),
            Request::GetColors { controller } => vec![controller.code()],
            Request::SetColors { controller, colors } => {
                let mut out = Vec::with_capacity(1 + ControllerColors::SIZE);
                out.push(controller.code());
                out.extend_from_slice(&colors.to_bytes());
                out
            }
            Request::ControllerState {
                ticks,
                active,
                report,
            } => {
                let mut out = Vec::with_capacity(2 + ControllerReport::SIZE);
                out.push(*ticks);
                out.push(u8::from(*active));
                out.extend_from_slice(&report.to_bytes());
                out
            }
        }
    }
}

/// Acknowledgment of a previously transmitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Plain { seq: SequenceNumber },
    I32 { seq: SequenceNumber, value: u32 },
    Data { seq: SequenceNumber, data: Vec<u8> },
}

impl Ack {
    /// Sequence number of the request being acknowledged.
    pub fn seq(&self) -> SequenceNumber {
        match self {
            Ack::Plain { seq } | Ack::I32 { seq, .. } | Ack::Data { seq, .. } => *seq,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Ack::Plain { .. } => MessageKind::Ack,
            Ack::I32 { .. } => MessageKind::AckI32,
            Ack::Data { .. } => MessageKind::AckData,
        }
    }

    pub fn value_u32(&self) -> Result<u32, SessionError> {
        match self {
            Ack::I32 { value, .. } => Ok(*value),
            other => Err(SessionError::ProtocolMismatch(format!(
                "expected {} reply, got {}",
                MessageKind::AckI32.name(),
                other.kind().name()
            ))),
        }
    }

    pub fn data(&self) -> Result<&[u8], SessionError> {
        match self {
            Ack::Data { data, .. } => Ok(data),
            other => Err(SessionError::ProtocolMismatch(format!(
                "expected {} reply, got {}",
                MessageKind::AckData.name(),
                other.kind().name()
            ))),
        }
    }
}

/// Anything the device sends us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Ack(Ack),
    /// Free-form device log line.
    Info(String),
}
