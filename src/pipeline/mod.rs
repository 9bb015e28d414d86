//! Outbound delivery pipeline.
//!
//! Every message flows through:
//! 1. `Scheduler`: wakes on a fixed cadence and asks for a sweep
//! 2. `Director`: fetches ready/retry/expired sets and isolates failures
//! 3. `Dispatcher`: tries providers in order and records each attempt
//! 4. `ProviderSelector`: the cached, ordered candidate list per channel
//!
//! State rules live in `state`; nothing else mutates `message_state`.

pub mod director;
pub mod dispatcher;
pub mod scheduler;
pub mod selector;
pub mod state;

pub use director::{Director, PhaseSummary, SweepSummary};
pub use dispatcher::{DispatchReport, Dispatcher, decrypt_parameters};
pub use scheduler::{Scheduler, spawn_scheduler};
pub use selector::ProviderSelector;
