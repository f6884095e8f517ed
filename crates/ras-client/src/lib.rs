//! ras-client: mobile-side core of the RAS pairing subsystem
//!
//! Takes a scanned pairing code to an authenticated channel over the best
//! available path, listens for encrypted address-change notifications and
//! reconnects when the daemon moves.

pub mod backoff;
pub mod notify;
pub mod pairing;
pub mod reconnect;
pub mod runtime;
pub mod state;
pub mod transport;

pub use backoff::ExponentialBackoff;
pub use notify::{NotificationChannel, Rejection};
pub use pairing::{AuthenticatedChannel, PairingError, PairingStateMachine};
pub use reconnect::{ReconnectController, ReconnectEvent, ReconnectStats, Reconnector};
pub use runtime::ClientRuntime;
pub use state::ConnectionSlot;
pub use transport::{
    CandidateError, EstablishedPath, PathCandidate, ResolveError, TransportContext,
    TransportResolver,
};
