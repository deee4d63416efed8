//! Host-side driver for a serial-attached game controller emulator.
//!
//! ```text
//! Controller ──► Session (request queue) ──► Transport ──► device
//!     │              ▲ acks                       │
//!     └─► StatusMonitor (status + watchdog) ◄─────┘
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod scope;
pub mod session;
pub mod transport;

pub use config::ConnectionSettings;
pub use controller::Controller;
pub use error::{CodecError, SessionError, TransportError};
pub use scope::CancellationScope;
pub use session::{Session, SessionSettings};
