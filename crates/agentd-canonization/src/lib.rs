//! Canonization pipeline: the timer-driven process that moves attested
//! transactions out of the pending queue and into append-only blocks
//! (§4.5).

pub mod link;
pub mod pipeline;

pub use link::Link;
pub use pipeline::{Config, Identity, Outcome, Pipeline, State};
