//! Network support for the SRT stack.
//!
//! A thin UDP wrapper exposing the operations the reactor needs: bind,
//! fix a peer, send, and receive with a bounded wait.

pub mod socket;

pub use socket::{SocketError, UdpEndpoint};
