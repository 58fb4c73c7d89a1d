mod engine;
mod error;
mod reconcile;
mod remote;
mod scheduler;
mod session;
mod store;
mod synchronizer;
mod writes;

#[cfg(test)]
mod testing;

pub use engine::{EngineConfig, KlappEngine};
pub use error::{
    AuthError, AuthFailure, EngineError, MarkReadError, NotFoundError, PollError,
    RemoteWriteError, TransportError,
};
pub use reconcile::{reconcile, ReconcileOptions, ReconcileReport, StoreState};
pub use scheduler::{next_delay, Cadence, ScheduleConfig};
pub use session::SessionManager;
pub use store::{FetchTicket, LocalRead, MessageStore, StoreChange};
pub use synchronizer::PollReport;
pub use writes::{MarkReadOutcome, PendingWrites};
