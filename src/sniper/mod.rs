//! The sniping core.
//!
//! This module handles:
//! - Implied probability from the live book
//! - Fire-instant timing with drift correction
//! - The per-market session state machine
//! - The scan → snipe → repeat supervisor

pub mod probability;
pub mod scheduler;
pub mod session;
pub mod supervisor;

pub use probability::{evaluate, favorite, ProbabilityEstimate};
pub use scheduler::{
    compute_fire_instant, Clock, DriftStatus, TimingSettings, TriggerPlan, TriggerScheduler, WallClock,
};
pub use session::{
    run_session, AbortReason, FailReason, SessionContext, SessionRecord, SessionState, SniperSession,
    Transition,
};
pub use supervisor::{
    http_client, live_context, side_pick, start_supervisor, SniperSupervisor, SupervisorSettings,
    SupervisorStats,
};
