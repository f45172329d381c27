//! Background work: scheduled sweeps over every user.

pub mod client;
pub mod scheduler;
pub mod sweep;

pub use client::HttpMarsApi;
pub use scheduler::spawn_schedulers;
pub use sweep::{BatchOrchestrator, MarsApi, Sweep, SweepError, SweepReport};
