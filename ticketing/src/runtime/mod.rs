//! Process wiring: connects the stores and the bus, spawns the outbox relay
//! and the saga consumers, and coordinates shutdown.

pub mod lifecycle;

pub use lifecycle::{Application, Infrastructure, RunningApplication, StartupError, connect_store, shutdown_signal};
