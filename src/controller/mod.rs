//! Controller façade
//!
//! Owns one connection: the request queue, its receive pump and the status
//! monitor. Callers drive the emulated controller through timed states:
//!
//! ```text
//! press_button / hold_stick / set_state
//!        │ ControllerStateReport (duration in ticks)
//!        ▼ chunks of ≤255 ticks, contiguous per command
//!   Session::issue ──► Transport
//! ```
//!
//! Commands are serialized by an async command lock so the chunks of one
//! command are never interleaved with the chunks of another. The remembered
//! controller state sits behind its own short-lived lock that is released
//! before anything is issued, so a caller stuck on backpressure never blocks
//! readers of the state.

pub mod report;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ConnectionSettings;
use crate::error::SessionError;
use crate::monitor::{MonitorHandle, StatusSink};
use crate::protocol::{Ack, ControllerType, Request, SequenceNumber};
use crate::scope::CancellationScope;
use crate::session::{Session, SessionSnapshot};
use crate::transport::Transport;

pub use report::{
    duration_to_ticks, split_ticks, Button, ControllerState, ControllerStateReport, Dpad, Stick,
    MAX_TICKS_PER_MESSAGE, TICK,
};

pub struct Controller {
    session: Session,
    controller_type: ControllerType,
    connection_scope: CancellationScope,
    receiver: JoinHandle<()>,
    monitor: MonitorHandle,
    state: Mutex<ControllerState>,
    command_lock: tokio::sync::Mutex<()>,
}

impl Controller {
    /// Starts the receive pump and the status monitor for `transport`.
    /// Must be called from within a tokio runtime.
    pub fn connect(
        transport: Arc<dyn Transport>,
        settings: &ConnectionSettings,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self, SessionError> {
        if !transport.is_ready() {
            return Err(SessionError::ConnectionNotReady);
        }
        info!("Connecting as {:?}", settings.controller_type);

        let session = Session::new(transport, settings.session_settings());
        let connection_scope = CancellationScope::root();
        let receiver = session.spawn_receiver(connection_scope.clone(), settings.receive_poll());
        let monitor = MonitorHandle::spawn(
            session.clone(),
            sink,
            settings.controller_type,
            settings.monitor_settings(),
        );

        Ok(Self {
            session,
            controller_type: settings.controller_type,
            connection_scope,
            receiver,
            monitor,
            state: Mutex::new(ControllerState::neutral()),
            command_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A fresh child of the current root. `cancel_all` cancels every scope
    /// handed out before it.
    pub fn scope(&self) -> CancellationScope {
        self.session.root_scope().child()
    }

    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// Why the connection failed, if it did.
    pub fn error_string(&self) -> Option<String> {
        self.session.failure()
    }

    /// The state of the most recently accepted command.
    pub fn current_state(&self) -> ControllerState {
        *self.lock_state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Holds `state` for `duration`. Returns once every chunk is queued, not
    /// once the device has played it; use [`Controller::wait_for_all`] for that.
    pub async fn set_state(
        &self,
        scope: &CancellationScope,
        state: ControllerState,
        duration: Duration,
    ) -> Result<(), SessionError> {
        let _command = self.command_lock.lock().await;
        self.issue_state(scope, state, duration).await
    }

    /// Presses `button` for `hold`, then lets go for `release`.
    pub async fn press_button(
        &self,
        scope: &CancellationScope,
        button: Button,
        hold: Duration,
        release: Duration,
    ) -> Result<(), SessionError> {
        debug!("Pressing {:?} for {:?}", button, hold);
        let _command = self.command_lock.lock().await;
        let pressed = ControllerState::neutral().with_button(button);
        self.issue_state(scope, pressed, hold).await?;
        self.issue_state(scope, ControllerState::neutral(), release)
            .await
    }

    /// Deflects `stick` to the raw position `(x, y)` for `duration`, then
    /// recentres it for one tick.
    pub async fn hold_stick(
        &self,
        scope: &CancellationScope,
        stick: Stick,
        x: u8,
        y: u8,
        duration: Duration,
    ) -> Result<(), SessionError> {
        debug!("Holding {:?} stick at ({}, {}) for {:?}", stick, x, y, duration);
        let _command = self.command_lock.lock().await;
        let deflected = ControllerState::neutral().with_stick(stick, x, y);
        self.issue_state(scope, deflected, duration).await?;
        self.issue_state(scope, ControllerState::neutral(), TICK)
            .await
    }

    /// Caller must hold the command lock.
    async fn issue_state(
        &self,
        scope: &CancellationScope,
        state: ControllerState,
        duration: Duration,
    ) -> Result<(), SessionError> {
        scope.check()?;

        let report = ControllerStateReport::new(state, duration, !state.is_neutral());
        for (index, chunk) in report.chunks().into_iter().enumerate() {
            self.session.issue(scope, chunk).await?;
            if index == 0 {
                *self.lock_state() = state;
            }
        }
        Ok(())
    }

    /// Queues a raw request.
    pub async fn send_request(
        &self,
        scope: &CancellationScope,
        request: Request,
    ) -> Result<SequenceNumber, SessionError> {
        let _command = self.command_lock.lock().await;
        self.session.issue(scope, request).await
    }

    pub async fn send_request_and_wait(
        &self,
        scope: &CancellationScope,
        request: Request,
    ) -> Result<Ack, SessionError> {
        let pending = {
            let _command = self.command_lock.lock().await;
            self.session.submit(scope, request).await?
        };
        pending.wait().await
    }

    pub async fn wait_for_all(&self, scope: &CancellationScope) -> Result<(), SessionError> {
        self.session.wait_for_all(scope).await
    }

    /// Emergency stop. Everything queued resolves as cancelled and the
    /// remembered state goes back to neutral.
    pub fn cancel_all(&self) {
        self.session.cancel_all();
        *self.lock_state() = ControllerState::neutral();
    }

    pub fn replace_on_next_command(&self) {
        self.session.replace_on_next_command();
    }

    /// Signals the monitor and the receive pump. Does not wait.
    pub fn stop(&self) {
        self.monitor.stop();
        self.connection_scope.cancel();
    }

    /// Stops the background tasks, waits for them and fails whatever is
    /// still pending.
    pub async fn shutdown(self) {
        info!("Shutting down controller connection");
        self.monitor.shutdown().await;
        self.connection_scope.cancel();
        if let Err(e) = self.receiver.await {
            error!("Receive pump failed: {}", e);
        }
        self.session.teardown("controller shut down");
    }
}
