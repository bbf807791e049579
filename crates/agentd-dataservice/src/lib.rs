//! In-process implementation of the data-service protocol (§4.3): request
//! decoding, capability-bitmap authorization, and dispatch against the
//! backing store. The socket-facing half lives in `src/bin/agentd-dataserviced.rs`.

pub mod service;
pub mod store;
pub mod wire;

pub use service::DataService;
pub use store::{ChildContextArena, Store, StoreError};
