//! Request Queue / Session
//!
//! Accepts requests from any task or thread, numbers them, transmits them in
//! issuance order and resolves each one exactly once: with its ack, as
//! `Cancelled`, or as `ConnectionLost`.
//!
//! # Bookkeeping
//!
//! ```text
//!  submit ─► [outbound buffer] ─► transport ─► [in-flight window] ─► ack
//!               ▲  max_pending bounds buffer + in-flight  │
//!               └────────── pump() refills ◄──────────────┘
//! ```
//!
//! All bookkeeping (sequence numbers, buffer, pending table, transmission)
//! happens under one `std::sync::Mutex` that is never held across an `.await`.
//! Suspended callers wake through a shared [`Notify`] or their own oneshot
//! result cell.
//!
//! The in-flight window models the device's command queue: at most
//! `max_in_flight` frames are on the wire unacknowledged, the rest wait in the
//! local buffer, which is what `replace_on_next_command` operates on.

pub mod liveness;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

use crate::error::{CodecError, SessionError};
use crate::protocol::codec;
use crate::protocol::registry::MessageRegistry;
use crate::protocol::{Ack, InboundMessage, MessageKind, Request, SequenceNumber};
use crate::scope::{CancellationScope, WaiterId};
use crate::transport::Transport;

pub use liveness::LivenessState;

type Reply = Result<Ack, SessionError>;
type Resolution = (PendingSlot, Reply);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Accepted but unresolved requests before `submit` applies backpressure.
    pub max_pending: usize,
    /// Transmitted but unacknowledged requests the device can hold.
    pub max_in_flight: usize,
    pub log_everything: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_pending: 16,
            max_in_flight: 4,
            log_everything: false,
        }
    }
}

/// Point-in-time view of the queue for status displays.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub outstanding: usize,
    pub buffered: usize,
    pub in_flight: usize,
    pub next_seq: SequenceNumber,
    pub last_activity: Option<DateTime<Local>>,
    pub failure: Option<String>,
}

struct PendingSlot {
    seq: SequenceNumber,
    kind: MessageKind,
    scope: CancellationScope,
    waiter: WaiterId,
    reply: oneshot::Sender<Reply>,
}

struct Buffered {
    seq: SequenceNumber,
    kind: MessageKind,
    frame: Vec<u8>,
}

struct QueueState {
    next_seq: SequenceNumber,
    root: CancellationScope,
    pending: HashMap<SequenceNumber, PendingSlot>,
    outbound: VecDeque<Buffered>,
    in_flight: HashSet<SequenceNumber>,
    /// Kind the next accepted request of which supersedes buffered ones.
    replace_next: Option<MessageKind>,
    failure: Option<String>,
    last_activity: Option<DateTime<Local>>,
}

impl QueueState {
    /// Drops every buffered request of `kind`, resolving it as cancelled.
    fn supersede(&mut self, kind: MessageKind, done: &mut Vec<Resolution>) {
        let superseded: Vec<SequenceNumber> = self
            .outbound
            .iter()
            .filter(|buffered| buffered.kind == kind)
            .map(|buffered| buffered.seq)
            .collect();
        if superseded.is_empty() {
            return;
        }
        debug!(
            "Replacing {} buffered {} request(s)",
            superseded.len(),
            kind.name()
        );
        self.outbound.retain(|buffered| buffered.kind != kind);
        for seq in superseded {
            if let Some(slot) = self.pending.remove(&seq) {
                done.push((slot, Err(SessionError::Cancelled)));
            }
        }
    }

    fn teardown(&mut self, reason: &str, done: &mut Vec<Resolution>) {
        if self.failure.is_none() {
            self.failure = Some(reason.to_string());
        }
        let lost = SessionError::ConnectionLost(reason.to_string());
        done.extend(self.pending.drain().map(|(_, slot)| (slot, Err(lost.clone()))));
        self.outbound.clear();
        self.in_flight.clear();
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    registry: MessageRegistry,
    liveness: Arc<LivenessState>,
    settings: SessionSettings,
    queue: Mutex<QueueState>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs after the queue lock is released.
    fn finish(&self, done: Vec<Resolution>) {
        if done.is_empty() {
            return;
        }
        for (slot, reply) in done {
            slot.scope.deregister_waiter(slot.waiter);
            if let Err(e) = &reply {
                debug!("Request {} ({}) resolved: {}", slot.seq, slot.kind.name(), e);
            }
            // The receiver is gone for fire-and-forget requests.
            let _ = slot.reply.send(reply);
        }
        self.changed.notify_waiters();
    }

    /// Transmits buffered frames while the device window has room.
    fn pump(&self, queue: &mut QueueState, done: &mut Vec<Resolution>) {
        while queue.failure.is_none() && queue.in_flight.len() < self.settings.max_in_flight {
            if !self.transport.is_ready() {
                break;
            }
            let Some(next) = queue.outbound.pop_front() else {
                break;
            };
            self.log_frame("send", &next.frame);
            match self.transport.send(&next.frame) {
                Ok(()) => {
                    queue.in_flight.insert(next.seq);
                }
                Err(e) => {
                    error!("Failed to transmit request {}: {}", next.seq, e);
                    queue.teardown(&e.0, done);
                }
            }
        }
    }

    fn accept(
        self: &Arc<Self>,
        queue: &mut QueueState,
        scope: &CancellationScope,
        request: &Request,
        done: &mut Vec<Resolution>,
    ) -> Result<(SequenceNumber, oneshot::Receiver<Reply>), SessionError> {
        let kind = request.kind();
        if queue.replace_next == Some(kind) {
            queue.replace_next = None;
            queue.supersede(kind, done);
        }

        let seq = queue.next_seq;
        queue.next_seq = queue.next_seq.wrapping_add(1);

        let weak = Arc::downgrade(self);
        let waiter = scope.register_waiter(move || {
            if let Some(shared) = weak.upgrade() {
                shared.abandon(seq);
            }
        })?;

        let (reply, receiver) = oneshot::channel();
        queue.pending.insert(
            seq,
            PendingSlot {
                seq,
                kind,
                scope: scope.clone(),
                waiter,
                reply,
            },
        );
        queue.outbound.push_back(Buffered {
            seq,
            kind,
            frame: codec::encode_request(seq, request),
        });
        self.pump(queue, done);
        Ok((seq, receiver))
    }

    /// Resolves `seq` as cancelled if it is still pending. A transmitted frame
    /// keeps its in-flight slot until the device acks it.
    fn abandon(&self, seq: SequenceNumber) {
        let mut done = Vec::new();
        {
            let mut queue = self.lock();
            if let Some(slot) = queue.pending.remove(&seq) {
                queue.outbound.retain(|buffered| buffered.seq != seq);
                done.push((slot, Err(SessionError::Cancelled)));
            }
        }
        self.finish(done);
    }

    /// Settles a transmitted request. Replies for requests that never left
    /// the buffer are ignored.
    fn complete(&self, seq: SequenceNumber, reply: Reply) {
        let mut done = Vec::new();
        {
            let mut queue = self.lock();
            if !queue.in_flight.remove(&seq) {
                debug!("Ignoring reply for request {} that is not in flight", seq);
                return;
            }
            match queue.pending.remove(&seq) {
                Some(slot) => {
                    if reply.is_ok() {
                        self.liveness.record_ack();
                        queue.last_activity = Some(Local::now());
                    }
                    done.push((slot, reply));
                }
                None => debug!("Late reply for abandoned request {}", seq),
            }
            self.pump(&mut queue, &mut done);
        }
        self.finish(done);
        self.changed.notify_waiters();
    }

    fn log_frame(&self, direction: &str, bytes: &[u8]) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        if let Ok(frame) = codec::decode(bytes) {
            if let Some(text) = self.registry.format(&frame) {
                debug!("{} {}", direction, text);
            }
        }
    }
}

/// One per connection. Cloning shares the same queue.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// A request that was accepted into the queue.
pub struct PendingRequest {
    seq: SequenceNumber,
    scope: CancellationScope,
    reply: oneshot::Receiver<Reply>,
    session: Session,
}

impl PendingRequest {
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Waits for the resolution. Cancelling the scope during the wait resolves
    /// the request as `Cancelled` unless its ack got there first.
    pub async fn wait(self) -> Result<Ack, SessionError> {
        let PendingRequest {
            seq,
            scope,
            mut reply,
            session,
        } = self;

        tokio::select! {
            biased;
            outcome = &mut reply => flatten(outcome),
            _ = scope.cancelled() => {
                session.shared.abandon(seq);
                flatten(reply.await)
            }
        }
    }
}

fn flatten(outcome: Result<Reply, oneshot::error::RecvError>) -> Reply {
    outcome.unwrap_or_else(|_| {
        Err(SessionError::ConnectionLost(
            "request dropped by the queue".to_string(),
        ))
    })
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        info!(
            "Creating session: max_pending={}, max_in_flight={}",
            settings.max_pending, settings.max_in_flight
        );
        Self {
            shared: Arc::new(Shared {
                transport,
                registry: MessageRegistry::standard(settings.log_everything),
                liveness: Arc::new(LivenessState::new()),
                settings,
                queue: Mutex::new(QueueState {
                    next_seq: 0,
                    root: CancellationScope::root(),
                    pending: HashMap::new(),
                    outbound: VecDeque::new(),
                    in_flight: HashSet::new(),
                    replace_next: None,
                    failure: None,
                    last_activity: None,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// The scope `cancel_all` cancels. Replaced by a fresh one afterwards.
    pub fn root_scope(&self) -> CancellationScope {
        self.shared.lock().root.clone()
    }

    pub fn liveness(&self) -> Arc<LivenessState> {
        self.shared.liveness.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().failure.is_none() && self.shared.transport.is_ready()
    }

    /// Why the session was torn down, if it was.
    pub fn failure(&self) -> Option<String> {
        self.shared.lock().failure.clone()
    }

    /// Accepts `request`, waiting for queue space if `max_pending` requests are
    /// already unresolved.
    pub async fn submit(
        &self,
        scope: &CancellationScope,
        request: Request,
    ) -> Result<PendingRequest, SessionError> {
        let root = self.root_scope();
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let mut done = Vec::new();
            let accepted = {
                let mut queue = self.shared.lock();
                scope.check()?;
                root.check()?;
                if queue.failure.is_some() || !self.shared.transport.is_ready() {
                    return Err(SessionError::ConnectionNotReady);
                }
                if queue.pending.len() < self.shared.settings.max_pending {
                    Some(self.shared.accept(&mut queue, scope, &request, &mut done))
                } else {
                    debug!(
                        "Queue full ({} pending), waiting to submit {}",
                        queue.pending.len(),
                        request.kind().name()
                    );
                    None
                }
            };
            self.shared.finish(done);

            if let Some(accepted) = accepted {
                let (seq, reply) = accepted?;
                return Ok(PendingRequest {
                    seq,
                    scope: scope.clone(),
                    reply,
                    session: self.clone(),
                });
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = scope.cancelled() => return Err(SessionError::Cancelled),
            }
        }
    }

    /// Fire-and-forget.
    pub async fn issue(
        &self,
        scope: &CancellationScope,
        request: Request,
    ) -> Result<SequenceNumber, SessionError> {
        Ok(self.submit(scope, request).await?.seq())
    }

    pub async fn issue_and_wait(
        &self,
        scope: &CancellationScope,
        request: Request,
    ) -> Result<Ack, SessionError> {
        self.submit(scope, request).await?.wait().await
    }

    /// Waits until nothing issued under `scope` or its descendants is pending.
    pub async fn wait_for_all(&self, scope: &CancellationScope) -> Result<(), SessionError> {
        let root = self.root_scope();
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let queue = self.shared.lock();
                scope.check()?;
                root.check()?;
                let outstanding = queue
                    .pending
                    .values()
                    .filter(|slot| slot.scope.is_within(scope))
                    .count();
                if outstanding == 0 {
                    return match &queue.failure {
                        Some(reason) => Err(SessionError::ConnectionLost(reason.clone())),
                        None => Ok(()),
                    };
                }
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = scope.cancelled() => return Err(SessionError::Cancelled),
            }
        }
    }

    /// Emergency stop: every pending request resolves as `Cancelled`, the root
    /// scope is cancelled and replaced.
    pub fn cancel_all(&self) {
        let mut done = Vec::new();
        let old_root = {
            let mut queue = self.shared.lock();
            done.extend(
                queue
                    .pending
                    .drain()
                    .map(|(_, slot)| (slot, Err(SessionError::Cancelled))),
            );
            queue.outbound.clear();
            queue.in_flight.clear();
            queue.replace_next = None;
            std::mem::replace(&mut queue.root, CancellationScope::root())
        };
        info!("Cancelling all commands ({} pending)", done.len());
        old_root.cancel();
        self.shared.finish(done);
        self.shared.changed.notify_waiters();
    }

    /// The next controller state request replaces every buffered, not yet
    /// transmitted state request. Consumed by that request; requests of other
    /// kinds pass through without touching it.
    pub fn replace_on_next_command(&self) {
        self.replace_on_next(MessageKind::ControllerState);
    }

    pub fn replace_on_next(&self, kind: MessageKind) {
        self.shared.lock().replace_next = Some(kind);
    }

    /// Resolves everything pending as `ConnectionLost`. The session stays
    /// unusable afterwards.
    pub fn teardown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut done = Vec::new();
        {
            let mut queue = self.shared.lock();
            queue.teardown(&reason, &mut done);
        }
        warn!("Session torn down: {} ({} pending lost)", reason, done.len());
        self.shared.finish(done);
        self.shared.changed.notify_waiters();
    }

    /// Feeds one inbound frame. Malformed frames are logged, dropped and
    /// reported; the session keeps going.
    pub fn handle_inbound(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let message = match codec::decode_inbound(bytes) {
            Ok(message) => message,
            Err(e) => {
                // An ack whose schema is off still settles its request.
                if let Some(seq) = codec::acked_seq(bytes) {
                    warn!("Reply to request {} does not fit its schema: {}", seq, e);
                    self.shared
                        .complete(seq, Err(SessionError::ProtocolMismatch(e.to_string())));
                } else {
                    warn!("Dropping inbound frame: {}", e);
                }
                return Err(e);
            }
        };
        self.shared.log_frame("recv", bytes);
        match message {
            InboundMessage::Ack(ack) => self.shared.complete(ack.seq(), Ok(ack)),
            InboundMessage::Info(text) => info!("Device: {}", text),
        }
        Ok(())
    }

    /// Drains the transport and retries stalled transmissions. Returns the
    /// number of frames read.
    pub fn poll_transport(&self) -> usize {
        let mut received = 0;
        while let Some(bytes) = self.shared.transport.try_receive() {
            received += 1;
            let _ = self.handle_inbound(&bytes);
        }

        let mut done = Vec::new();
        {
            let mut queue = self.shared.lock();
            if !queue.outbound.is_empty() {
                self.shared.pump(&mut queue, &mut done);
            }
        }
        self.shared.finish(done);
        received
    }

    /// Polls the transport every `interval` until `scope` is cancelled. Tears
    /// the session down when the transport stops being ready.
    pub fn spawn_receiver(&self, scope: CancellationScope, interval: Duration) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            debug!("Receive pump started (every {:?})", interval);
            let mut was_ready = session.shared.transport.is_ready();
            loop {
                session.poll_transport();

                let ready = session.shared.transport.is_ready();
                if was_ready && !ready {
                    session.teardown("transport is no longer ready");
                }
                was_ready = ready;

                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Receive pump stopped");
        })
    }

    #[cfg(test)]
    fn set_next_seq(&self, seq: SequenceNumber) {
        self.shared.lock().next_seq = seq;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let queue = self.shared.lock();
        SessionSnapshot {
            outstanding: queue.pending.len(),
            buffered: queue.outbound.len(),
            in_flight: queue.in_flight.len(),
            next_seq: queue.next_seq,
            last_activity: queue.last_activity,
            failure: queue.failure.clone(),
        }
    }
}
