use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use padlink::controller::{Button, Dpad, Stick};
use padlink::monitor::TracingStatusSink;
use padlink::transport::loopback::LoopbackTransport;
use padlink::{ConnectionSettings, Controller};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = ConnectionSettings::default_path();
    let settings = ConnectionSettings::load_or_default(path.as_deref())?;
    info!("Using {:?}", settings);

    // No serial link attached: drive the built-in loopback device.
    let device = Arc::new(LoopbackTransport::new());
    let controller = Controller::connect(device.clone(), &settings, Arc::new(TracingStatusSink))
        .map_err(|e| eyre!("Failed to connect: {}", e))?;
    let scope = controller.scope();

    for button in [Button::A, Button::B, Button::Home] {
        controller
            .press_button(
                &scope,
                button,
                Duration::from_millis(100),
                Duration::from_millis(100),
            )
            .await?;
    }
    controller
        .set_state(
            &scope,
            padlink::controller::ControllerState::neutral().with_dpad(Dpad::Up),
            Duration::from_millis(300),
        )
        .await?;
    controller
        .hold_stick(&scope, Stick::Left, 0x80, 0x00, Duration::from_secs(5))
        .await?;
    controller.wait_for_all(&scope).await?;

    let snapshot = controller.snapshot();
    info!(
        "Device saw {} frames, next seq {}, last activity {:?}",
        device.sent_frames().len(),
        snapshot.next_seq,
        snapshot.last_activity
    );

    tokio::time::sleep(settings.monitor_settings().period * 2).await;
    controller.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
