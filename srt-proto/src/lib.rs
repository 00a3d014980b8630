//! Sans-IO core of the SRT protocol.
//!
//! Everything here is driven from outside: datagrams and clock readings go
//! in, packets to transmit and payloads to deliver come out. The
//! [`connection::Connection`] orchestrator owns the engines (send, receive,
//! TSBPD, congestion, flow, timers, crypto) for one session; the sibling
//! crates supply the UDP socket and the event loop.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod control;
pub mod flow;
pub mod handshake;
pub mod packet;
pub mod recv;
pub mod rtt;
pub mod send;
pub mod sequence;
pub mod timer;
pub mod tsbpd;

pub use config::{ConfigError, SrtConfig};
pub use congestion::{CongestionController, CongestionStats, LossCondition};
pub use connection::{
    Action, CloseReason, ConnStats, Connection, ConnectionError, Role, State, StatsSnapshot,
};
pub use control::{AckBody, LossEntry, NakBody};
pub use flow::{FlowController, FlowDenial, FlowStats};
pub use handshake::{HandshakeBody, HandshakeError, Negotiated};
pub use packet::{
    CodecError, ControlHeader, ControlKind, ControlPacket, DataHeader, DataPacket, KeyFlag,
    Packet, PacketPosition, DEFAULT_MSS, HEADER_LEN,
};
pub use recv::{ReceiveEngine, RecvStats};
pub use rtt::{NetworkCondition, RttEstimator};
pub use send::{SendEngine, SendError, SendStats};
pub use sequence::{MessageNumber, SeqNumber};
pub use timer::{TimerEvent, TimerKind, TimerSet};
pub use tsbpd::{TsbpdScheduler, TsbpdStats};
