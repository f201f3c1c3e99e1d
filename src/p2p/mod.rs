//! P2P networking module - Wire messages, peers and transports

mod peer;
mod protocol;
mod server;
mod transport;

pub use peer::*;
pub use protocol::*;
pub use server::*;
pub use transport::*;
