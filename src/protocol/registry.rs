//! Message Registry: message-type id → diagnostic formatter.
//!
//! Built explicitly from [`STANDARD_FORMATTERS`] when a session starts. Only the
//! logging path consults it; decoding never does.

use std::collections::HashMap;

use crate::protocol::codec::Frame;
use crate::protocol::{ControllerColors, ControllerReport, ControllerType, MessageKind};

pub type Formatter = fn(&Frame) -> String;

struct Entry {
    /// Only printed when `log_everything` is on.
    verbose: bool,
    formatter: Formatter,
}

pub struct MessageRegistry {
    entries: HashMap<u16, Entry>,
    log_everything: bool,
}

/// `(kind, verbose, formatter)`
pub const STANDARD_FORMATTERS: &[(MessageKind, bool, Formatter)] = &[
    (MessageKind::Ack, false, format_ack),
    (MessageKind::AckI32, true, format_ack_i32),
    (MessageKind::AckData, false, format_ack_data),
    (MessageKind::Info, false, format_info),
    (MessageKind::RequestStatus, true, format_request_status),
    (MessageKind::GetColors, false, format_get_colors),
    (MessageKind::SetColors, false, format_set_colors),
    (MessageKind::ControllerState, true, format_controller_state),
];

impl MessageRegistry {
    pub fn empty(log_everything: bool) -> Self {
        Self {
            entries: HashMap::new(),
            log_everything,
        }
    }

    pub fn standard(log_everything: bool) -> Self {
        let mut registry = Self::empty(log_everything);
        for (kind, verbose, formatter) in STANDARD_FORMATTERS {
            registry.register(kind.id(), *verbose, *formatter);
        }
        registry
    }

    pub fn register(&mut self, kind_id: u16, verbose: bool, formatter: Formatter) {
        self.entries.insert(kind_id, Entry { verbose, formatter });
    }

    /// `None` when the kind is unknown or suppressed.
    pub fn format(&self, frame: &Frame) -> Option<String> {
        let entry = self.entries.get(&frame.kind_id)?;
        if entry.verbose && !self.log_everything {
            return None;
        }
        Some((entry.formatter)(frame))
    }
}

fn invalid_size(prefix: &str) -> String {
    format!("{prefix} - (invalid size)")
}

fn acked_seq(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn format_ack(frame: &Frame) -> String {
    match acked_seq(&frame.payload) {
        Some(acked) if frame.payload.len() == 4 => format!("ack() - seqnum = {acked}"),
        _ => invalid_size("ack()"),
    }
}

fn format_ack_i32(frame: &Frame) -> String {
    if frame.payload.len() != 8 {
        return invalid_size("ack_i32()");
    }
    let acked = acked_seq(&frame.payload).unwrap_or_default();
    let value = acked_seq(&frame.payload[4..]).unwrap_or_default();
    format!("ack_i32() - seqnum = {acked}, value = 0x{value:08x}")
}

fn format_ack_data(frame: &Frame) -> String {
    match acked_seq(&frame.payload) {
        Some(acked) => format!(
            "ack_data() - seqnum = {acked}, bytes = {}",
            frame.payload.len() - 4
        ),
        None => invalid_size("ack_data()"),
    }
}

fn format_info(frame: &Frame) -> String {
    format!("info() - {}", String::from_utf8_lossy(&frame.payload))
}

fn format_request_status(frame: &Frame) -> String {
    if !frame.payload.is_empty() {
        return invalid_size("controller_status()");
    }
    format!("controller_status() - seqnum = {}", frame.seq)
}

fn controller_name(code: u8) -> String {
    match ControllerType::from_code(code) {
        Some(controller) => format!("{controller:?}"),
        None => format!("unknown({code})"),
    }
}

fn format_get_colors(frame: &Frame) -> String {
    match frame.payload.as_slice() {
        [code] => format!(
            "get_colors() - seqnum = {}, controller = {}",
            frame.seq,
            controller_name(*code)
        ),
        _ => invalid_size("get_colors()"),
    }
}

fn format_set_colors(frame: &Frame) -> String {
    match frame.payload.split_first() {
        Some((code, rest)) if rest.len() == ControllerColors::SIZE => format!(
            "set_colors() - seqnum = {}, controller = {}",
            frame.seq,
            controller_name(*code)
        ),
        _ => invalid_size("set_colors()"),
    }
}

fn format_controller_state(frame: &Frame) -> String {
    if frame.payload.len() != 2 + ControllerReport::SIZE {
        return invalid_size("controller_state()");
    }
    format!(
        "controller_state() - seqnum = {}, ticks = {}, active = {}",
        frame.seq, frame.payload[0], frame.payload[1]
    )
}
