//! Status / watchdog monitor, one per connection.
//!
//! # Lifecycle
//!
//! ```text
//! Probing ──probe()──► Monitoring ──run()──► (stopped)
//!    │ colour query        │ status loop  ─┐
//!    │ wrong size ⇒        │ watchdog loop ─┤ both end within one
//!    ▼ ProtocolMismatch    ▼               │ sleep of stop()
//!  session torn down     status line ◄─────┘
//! ```
//!
//! The status loop pings the device every `period` and writes the result to
//! the status line. The watchdog loop only reads the last-ack timestamp and
//! raises a degraded-liveness warning once silence exceeds twice the period;
//! it never touches the connection. The warning is cleared by the next
//! successful status check, not by any other ack.
//!
//! Both loops sleep on `tokio::select!` against the monitor's scope, so
//! [`MonitorHandle::stop`] wakes them immediately.

pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::protocol::{ControllerColors, ControllerType, Request};
use crate::scope::CancellationScope;
use crate::session::Session;

pub use sink::{RecordingStatusSink, StatusColor, StatusSink, TracingStatusSink};

pub const FAILURE_LINE: &str = "Error: See log for more information.";
pub const DEGRADED_PREFIX: &str = "Last Ack:";

const STATUS_CONNECTED: u32 = 1;
const STATUS_PAIRED: u32 = 2;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub period: Duration,
    pub watchdog_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            watchdog_interval: Duration::from_millis(250),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum MonitorState {
    Probing,
    Monitoring,
}

#[machine]
pub struct StatusMonitor<S: MonitorState> {
    session: Session,
    sink: Arc<dyn StatusSink>,
    controller_type: ControllerType,
    settings: MonitorSettings,
    scope: CancellationScope,
    color_summary: String,
}

impl StatusMonitor<Probing> {
    pub fn create(
        session: Session,
        sink: Arc<dyn StatusSink>,
        controller_type: ControllerType,
        settings: MonitorSettings,
        scope: CancellationScope,
    ) -> Self {
        Self::new(
            session,
            sink,
            controller_type,
            settings,
            scope,
            String::new(), // color_summary
        )
    }

    /// Reads the controller colours. A reply of the wrong shape is fatal.
    pub async fn probe(mut self) -> Result<StatusMonitor<Monitoring>, SessionError> {
        info!("Reading controller colors...");
        let ack = loop {
            let outcome = self
                .session
                .issue_and_wait(
                    &self.scope,
                    Request::GetColors {
                        controller: self.controller_type,
                    },
                )
                .await;
            match outcome {
                // Swept by cancel_all, not by stop().
                Err(SessionError::Cancelled) if !self.scope.is_cancelled() => {
                    debug!("Color query cancelled, asking again");
                }
                other => break other?,
            }
        };

        let data = ack.data()?;
        let colors = ControllerColors::from_bytes(data).map_err(|_| {
            SessionError::ProtocolMismatch(format!(
                "invalid response size to get_colors: body = {}",
                data.len()
            ))
        })?;
        info!("Reading controller colors... Done");

        self.color_summary = color_summary(self.controller_type, &colors);
        Ok(self.transition())
    }
}

impl StatusMonitor<Monitoring> {
    pub async fn run(self) {
        info!("Status monitor running every {:?}", self.settings.period);
        let degraded = Arc::new(AtomicBool::new(false));

        let watchdog_scope = self.scope.child();
        let watchdog = tokio::spawn(watchdog_loop(
            self.session.clone(),
            self.sink.clone(),
            watchdog_scope.clone(),
            degraded.clone(),
            self.settings.clone(),
        ));

        self.status_loop(&degraded).await;

        watchdog_scope.cancel();
        if let Err(e) = watchdog.await {
            error!("Watchdog task failed: {}", e);
        }
        info!("Status monitor stopped");
    }

    async fn status_loop(&self, degraded: &AtomicBool) {
        let mut next_ping = Instant::now();
        loop {
            if self.scope.is_cancelled() || !self.session.is_ready() {
                break;
            }

            match self.query_status().await {
                Ok(line) => {
                    degraded.store(false, Ordering::Relaxed);
                    self.sink.set_status_line(&line, StatusColor::Normal);
                }
                Err(SessionError::Cancelled) if self.scope.is_cancelled() => break,
                Err(SessionError::Cancelled) => debug!("Status request swept by cancel_all"),
                Err(SessionError::ConnectionNotReady) | Err(SessionError::ConnectionLost(_)) => {
                    break
                }
                Err(e @ SessionError::ProtocolMismatch(_)) => {
                    error!("Status reply does not match the protocol: {}", e);
                    self.sink.set_status_line(FAILURE_LINE, StatusColor::Red);
                    self.session.teardown(e.to_string());
                    break;
                }
                Err(e) => {
                    warn!("Status query failed: {}", e);
                    self.sink.set_status_line(&e.to_string(), StatusColor::Red);
                }
            }

            next_ping = next_deadline(next_ping, self.settings.period);
            tokio::select! {
                _ = self.scope.cancelled() => break,
                _ = sleep_until(next_ping) => {}
            }
        }
    }

    async fn query_status(&self) -> Result<String, SessionError> {
        let status = self
            .session
            .issue_and_wait(&self.scope, Request::RequestStatus)
            .await?
            .value_u32()?;
        Ok(format_status(status, &self.color_summary))
    }
}

async fn watchdog_loop(
    session: Session,
    sink: Arc<dyn StatusSink>,
    scope: CancellationScope,
    degraded: Arc<AtomicBool>,
    settings: MonitorSettings,
) {
    let liveness = session.liveness();
    let limit = settings.period * 2;
    let mut next_check = Instant::now();
    loop {
        if scope.is_cancelled() || !session.is_ready() {
            break;
        }

        let silence = liveness.since_last_ack();
        if silence > limit && !degraded.swap(true, Ordering::Relaxed) {
            let text = format!("{} {:.3} seconds ago", DEGRADED_PREFIX, silence.as_secs_f64());
            warn!("Connection issue detected: {}", text);
            sink.set_status_line(&text, StatusColor::Red);
        }

        next_check = next_deadline(next_check, settings.watchdog_interval);
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = sleep_until(next_check) => {}
        }
    }
    debug!("Watchdog stopped");
}

/// Next tick on a fixed grid. A missed tick restarts the grid from now
/// instead of bursting, and the result is never more than one period ahead.
fn next_deadline(previous: Instant, period: Duration) -> Instant {
    let now = Instant::now();
    let next = previous + period;
    if next <= now || next > now + period {
        now + period
    } else {
        next
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn format_status(status: u32, color_summary: &str) -> String {
    let mut line = format!(
        "Connected: {} - Paired: {}",
        yes_no(status & STATUS_CONNECTED != 0),
        yes_no(status & STATUS_PAIRED != 0)
    );
    if !color_summary.is_empty() {
        line.push_str(" - ");
        line.push_str(color_summary);
    }
    line
}

fn hex(rgb: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

fn color_summary(controller_type: ControllerType, colors: &ControllerColors) -> String {
    match controller_type {
        ControllerType::WirelessProController => format!(
            "{} {} {}",
            hex(colors.left_grip),
            hex(colors.body),
            hex(colors.right_grip)
        ),
        ControllerType::LeftJoycon | ControllerType::RightJoycon => hex(colors.body),
        ControllerType::WiredProController => String::new(),
    }
}

/// Owner's handle on a running monitor.
pub struct MonitorHandle {
    scope: CancellationScope,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn spawn(
        session: Session,
        sink: Arc<dyn StatusSink>,
        controller_type: ControllerType,
        settings: MonitorSettings,
    ) -> Self {
        let scope = CancellationScope::root();
        let monitor = StatusMonitor::create(
            session.clone(),
            sink.clone(),
            controller_type,
            settings,
            scope.clone(),
        );

        let task = tokio::spawn(async move {
            match monitor.probe().await {
                Ok(monitoring) => monitoring.run().await,
                Err(SessionError::Cancelled) => debug!("Status monitor stopped while probing"),
                Err(e) => {
                    error!("Controller probe failed: {}", e);
                    sink.set_status_line(FAILURE_LINE, StatusColor::Red);
                    if matches!(e, SessionError::ProtocolMismatch(_)) {
                        session.teardown(e.to_string());
                    }
                }
            }
        });

        Self { scope, task }
    }

    /// Signals both loops. Does not wait.
    pub fn stop(&self) {
        self.scope.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops and waits for both loops to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!("Status monitor task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode;
    use crate::protocol::{Ack, InboundMessage, MessageKind};
    use crate::session::SessionSettings;
    use crate::transport::loopback::{standard_replies, LoopbackTransport};

    struct Harness {
        device: Arc<LoopbackTransport>,
        session: Session,
        sink: Arc<RecordingStatusSink>,
        pump_scope: CancellationScope,
        pump: JoinHandle<()>,
    }

    impl Harness {
        fn new(device: LoopbackTransport) -> Self {
            let device = Arc::new(device);
            let session = Session::new(device.clone(), SessionSettings::default());
            let pump_scope = CancellationScope::root();
            let pump = session.spawn_receiver(pump_scope.clone(), Duration::from_millis(1));
            Self {
                device,
                session,
                sink: Arc::new(RecordingStatusSink::default()),
                pump_scope,
                pump,
            }
        }

        fn spawn_monitor(&self, controller_type: ControllerType) -> MonitorHandle {
            MonitorHandle::spawn(
                self.session.clone(),
                self.sink.clone(),
                controller_type,
                MonitorSettings::default(),
            )
        }

        async fn close(self) {
            self.pump_scope.cancel();
            self.pump.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_status_with_colour_summary() {
        let colors = ControllerColors {
            body: [0x10, 0x20, 0x30],
            buttons: [0; 3],
            left_grip: [0xff, 0, 0],
            right_grip: [0, 0, 0xff],
        };
        let harness = Harness::new(LoopbackTransport::with_colors(colors));
        let monitor = harness.spawn_monitor(ControllerType::WirelessProController);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let lines = harness.sink.lines();
        assert_eq!(lines.len(), 3, "{lines:?}");
        assert_eq!(
            lines[0],
            (
                "Connected: Yes - Paired: Yes - #ff0000 #102030 #0000ff".to_string(),
                StatusColor::Normal
            )
        );
        assert_eq!(harness.sink.count_matching(DEGRADED_PREFIX), 0);

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_raises_exactly_one_degraded_warning() {
        let harness = Harness::new(LoopbackTransport::new());
        harness.device.hold_replies();
        let monitor = harness.spawn_monitor(ControllerType::LeftJoycon);

        // Let the colour query through, then keep every status reply back.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(harness.device.release_next());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(harness.sink.count_matching(DEGRADED_PREFIX), 1);
        let (text, color) = harness.sink.last().unwrap();
        assert!(text.starts_with("Last Ack: 2."), "{text}");
        assert!(text.ends_with(" seconds ago"), "{text}");
        assert_eq!(color, StatusColor::Red);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(harness.sink.count_matching(DEGRADED_PREFIX), 1);

        // The held status reply is the monitor's next successful check.
        assert!(harness.device.release_next());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            harness.sink.last(),
            Some((
                "Connected: Yes - Paired: Yes - #000000".to_string(),
                StatusColor::Normal
            ))
        );

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_acks_do_not_clear_the_warning() {
        let harness = Harness::new(LoopbackTransport::new());
        harness.device.hold_replies();
        let monitor = harness.spawn_monitor(ControllerType::WiredProController);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(harness.device.release_next());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(harness.sink.count_matching(DEGRADED_PREFIX), 1);

        // Some other request gets acked; liveness is fresh again but the
        // status check is still outstanding.
        let scope = harness.session.root_scope().child();
        let pending = harness
            .session
            .submit(&scope, Request::RequestStatus)
            .await
            .unwrap();
        let seq = pending.seq();
        harness
            .device
            .push_inbound(crate::protocol::codec::encode_inbound(
                0,
                &InboundMessage::Ack(Ack::I32 { seq, value: 3 }),
            ));
        assert!(pending.wait().await.is_ok());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let (text, color) = harness.sink.last().unwrap();
        assert!(text.starts_with(DEGRADED_PREFIX));
        assert_eq!(color, StatusColor::Red);
        assert_eq!(harness.sink.count_matching(DEGRADED_PREFIX), 1);

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_colour_reply_size_fails_the_connection() {
        let device = LoopbackTransport::with_responder(|frame| match frame.kind() {
            Ok(MessageKind::GetColors) => vec![InboundMessage::Ack(Ack::Data {
                seq: frame.seq,
                data: vec![1, 2, 3, 4, 5],
            })],
            _ => standard_replies(frame, &ControllerColors::default()),
        });
        let harness = Harness::new(device);
        let monitor = harness.spawn_monitor(ControllerType::WirelessProController);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_finished());
        assert_eq!(
            harness.sink.lines(),
            vec![(FAILURE_LINE.to_string(), StatusColor::Red)]
        );
        assert!(!harness.session.is_ready());
        let failure = harness.session.failure().unwrap();
        assert!(failure.contains("body = 5"), "{failure}");
        assert_eq!(
            harness.device.sent_kinds(),
            vec![MessageKind::GetColors]
        );

        monitor.shutdown().await;
        harness.close().await;
    }

    fn assert_failed(harness: &Harness, monitor: &MonitorHandle, reason: &str) {
        assert!(monitor.is_finished());
        assert_eq!(
            harness.sink.lines(),
            vec![(FAILURE_LINE.to_string(), StatusColor::Red)]
        );
        assert!(!harness.session.is_ready());
        let failure = harness.session.failure().unwrap();
        assert!(failure.contains(reason), "{failure}");
    }

    #[tokio::test(start_paused = true)]
    async fn status_reply_of_the_wrong_kind_fails_the_connection() {
        let device = LoopbackTransport::with_responder(|frame| match frame.kind() {
            Ok(MessageKind::RequestStatus) => {
                vec![InboundMessage::Ack(Ack::Plain { seq: frame.seq })]
            }
            _ => standard_replies(frame, &ControllerColors::default()),
        });
        let harness = Harness::new(device);
        let monitor = harness.spawn_monitor(ControllerType::WiredProController);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_failed(&harness, &monitor, "expected ack_i32 reply, got ack");
        assert_eq!(
            harness.device.sent_kinds(),
            vec![MessageKind::GetColors, MessageKind::RequestStatus]
        );

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_reply_of_the_wrong_size_fails_the_connection() {
        let harness = Harness::new(LoopbackTransport::new());
        harness.device.hold_replies();
        let monitor = harness.spawn_monitor(ControllerType::WiredProController);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(harness.device.release_next());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let status = harness
            .device
            .sent_frames()
            .into_iter()
            .find(|frame| frame.kind() == Ok(MessageKind::RequestStatus))
            .unwrap();
        let mut payload = status.seq.to_le_bytes().to_vec();
        payload.extend_from_slice(&[3, 0]);
        harness
            .device
            .push_inbound(encode(MessageKind::AckI32.id(), 0, &payload));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_failed(&harness, &monitor, "invalid payload for ack_i32");

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_observed_within_one_period() {
        let harness = Harness::new(LoopbackTransport::new());
        let monitor = harness.spawn_monitor(ControllerType::WirelessProController);
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let started = Instant::now();
        monitor.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_requests_survive_cancel_all() {
        let harness = Harness::new(LoopbackTransport::new());
        harness.device.hold_replies();
        let monitor = harness.spawn_monitor(ControllerType::WiredProController);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(harness.device.release_next());
        tokio::time::sleep(Duration::from_millis(5)).await;

        harness.session.cancel_all();
        harness.device.release_replies();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!monitor.is_finished());
        assert_eq!(
            harness.sink.last(),
            Some(("Connected: Yes - Paired: Yes".to_string(), StatusColor::Normal))
        );

        monitor.shutdown().await;
        harness.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_stay_on_grid_but_never_run_ahead() {
        let start = Instant::now();
        let period = Duration::from_secs(1);
        assert_eq!(next_deadline(start, period), start + period);
        let far_future = start + Duration::from_secs(10);
        assert_eq!(next_deadline(far_future, period), start + period);
        let long_ago = start - Duration::from_secs(10);
        assert_eq!(next_deadline(long_ago, period), start + period);
    }
}
