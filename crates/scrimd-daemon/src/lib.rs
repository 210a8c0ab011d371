//! scrimd-daemon - the long-running orchestrator process.
//!
//! One daemon drives one or more organizational units through an
//! event: a per-unit automation loop ticks the check-in scheduler,
//! the distribution trigger, and the cleanup/rollover steps; an
//! operator control socket accepts line-delimited JSON commands; all
//! state mutations funnel through a per-unit lock and are persisted
//! atomically after every change.
//!
//! The domain logic lives in `scrimd-core`; this crate owns the
//! locks, the polling loop, and every real I/O surface (outbox
//! messaging, file-backed roster, external render command, Unix
//! socket protocol).

pub mod automation;
pub mod orchestrator;
pub mod outbox;
pub mod protocol;
pub mod render;
pub mod roster;
pub mod state;

pub use automation::AutomationLoop;
pub use orchestrator::{OpError, Orchestrator, StatusView};
pub use outbox::{MemorySink, OutboxSink, SinkRecord};
pub use state::{UnitHandle, UnitRegistry};
