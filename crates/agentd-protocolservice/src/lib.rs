//! Protocol service: terminates client connections, runs the cryptographic
//! handshake, and proxies the authenticated command phase on to the data
//! service and random service (§4.4).

pub mod connection;
pub mod directory;
pub mod fdpass;
pub mod outbound;
pub mod wire;

pub use connection::{connection_caps, ConnState, Connection, ServerIdentity};
pub use directory::EntityDirectory;
pub use outbound::OutboundLink;
