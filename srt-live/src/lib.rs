//! SRT for Rust.
//!
//! [`SrtSession`] is the application entry point: connect or accept one
//! SRT connection over UDP and exchange messages with bounded-latency
//! delivery. The protocol machinery lives in `srt-proto`, encryption in
//! `srt-crypt`, socket and clock plumbing in `srt-net`.

pub mod session;

pub use srt_crypt as crypt;
pub use srt_net as net;
pub use srt_proto as proto;

pub use proto::{Action, CloseReason, SrtConfig, StatsSnapshot};
pub use session::{SessionError, SrtSession};
