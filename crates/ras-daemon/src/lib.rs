//! ras-daemon: host side of the RAS pairing subsystem
//!
//! The daemon owns the pairing record, answers signaling over HTTP and the
//! relay, serves authenticated client links on every path and publishes
//! encrypted notifications when its address changes.

pub mod connection;
pub mod daemon;
pub mod pairing;
pub mod publisher;
pub mod relay_listener;
pub mod signaling;
pub mod state;
pub mod transport;

pub use daemon::Daemon;
pub use pairing::PairingRecord;
pub use state::{DaemonEvent, DaemonState};
