//! In-process simulated device.
//!
//! Acknowledges every request the way the controller emulator does: colour
//! queries get the configured colours, status queries get a connected+paired
//! status word, everything else a plain ack. Replies can be held back and
//! released one by one to drive timing-sensitive scenarios.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::codec::{self, Frame};
use crate::protocol::{Ack, ControllerColors, InboundMessage, MessageKind};
use crate::transport::Transport;

/// Status word bits: connected | paired.
pub const STATUS_CONNECTED_PAIRED: u32 = 0b11;

pub type Responder = Box<dyn Fn(&Frame) -> Vec<InboundMessage> + Send + Sync>;

#[derive(Default)]
struct LoopbackState {
    ready: bool,
    holding: bool,
    sent: Vec<Frame>,
    held: VecDeque<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    device_seq: u32,
}

pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    responder: Responder,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_colors(ControllerColors::default())
    }

    pub fn with_colors(colors: ControllerColors) -> Self {
        Self::with_responder(move |frame| standard_replies(frame, &colors))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Frame) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(LoopbackState {
                ready: true,
                ..LoopbackState::default()
            }),
            responder: Box::new(responder),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Replies produced from now on are kept back until released.
    pub fn hold_replies(&self) {
        self.lock().holding = true;
    }

    /// Stops holding and delivers everything held so far, in order.
    pub fn release_replies(&self) -> usize {
        let mut state = self.lock();
        state.holding = false;
        let held: Vec<_> = state.held.drain(..).collect();
        let count = held.len();
        state.inbound.extend(held);
        count
    }

    /// Delivers the oldest held reply. Keeps holding.
    pub fn release_next(&self) -> bool {
        let mut state = self.lock();
        match state.held.pop_front() {
            Some(reply) => {
                state.inbound.push_back(reply);
                true
            }
            None => false,
        }
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Queues raw bytes as if the device had sent them.
    pub fn push_inbound(&self, bytes: Vec<u8>) {
        self.lock().inbound.push_back(bytes);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.lock()
            .sent
            .iter()
            .filter_map(|frame| frame.kind().ok())
            .collect()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let frame = match codec::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Loopback device received garbage: {}", e);
                return Ok(());
            }
        };
        let replies = (self.responder)(&frame);

        let mut state = self.lock();
        if !state.ready {
            return Err(TransportError("loopback link is closed".to_string()));
        }
        debug!("Loopback device received seq {}", frame.seq);
        state.sent.push(frame);
        for reply in replies {
            let seq = state.device_seq;
            state.device_seq = state.device_seq.wrapping_add(1);
            let bytes = codec::encode_inbound(seq, &reply);
            if state.holding {
                state.held.push_back(bytes);
            } else {
                state.inbound.push_back(bytes);
            }
        }
        Ok(())
    }

    fn try_receive(&self) -> Option<Vec<u8>> {
        self.lock().inbound.pop_front()
    }

    fn is_ready(&self) -> bool {
        self.lock().ready
    }
}

/// The emulator's reply for one request frame.
pub fn standard_replies(frame: &Frame, colors: &ControllerColors) -> Vec<InboundMessage> {
    let ack = match frame.kind() {
        Ok(MessageKind::GetColors) => Ack::Data {
            seq: frame.seq,
            data: colors.to_bytes().to_vec(),
        },
        Ok(MessageKind::RequestStatus) => Ack::I32 {
            seq: frame.seq,
            value: STATUS_CONNECTED_PAIRED,
        },
        Ok(_) => Ack::Plain { seq: frame.seq },
        Err(_) => return Vec::new(),
    };
    vec![InboundMessage::Ack(ack)]
}
