//! Connection orchestrator.
//!
//! One `Connection` owns every engine for a single SRT session and is the
//! only thing that mutates them. It consumes raw datagrams and clock
//! readings, and produces [`Action`]s: datagrams to transmit, payloads to
//! deliver, and lifecycle events. It never touches a socket or reads the
//! clock itself, which keeps the whole protocol deterministic under test.

use crate::config::{ConfigError, SrtConfig};
use crate::congestion::{CongestionConfig, CongestionController, CongestionStats};
use crate::control::{AckBody, NakBody};
use crate::flow::{FlowController, FlowStats};
use crate::handshake::{
    CallerHandshake, HandshakeBody, HandshakeConfig, HandshakeError, HandshakeStep,
    ListenerHandshake, Negotiated, RETRY_INTERVAL,
};
use crate::packet::{
    ControlHeader, ControlKind, ControlPacket, DataHeader, DataPacket, KeyFlag, Packet,
    PacketPosition, HEADER_LEN,
};
use crate::recv::{AckSnapshot, ReceiveEngine, RecvConfig, RecvStats};
use crate::rtt::RttEstimator;
use crate::send::{SendConfig, SendEngine, SendError, SendStats};
use crate::sequence::{MessageNumber, SeqNumber, SEQ_MAX};
use crate::timer::{TimerEvent, TimerSet};
use crate::tsbpd::{TsbpdScheduler, TsbpdStats};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use srt_crypt::{derive_key, generate_salt, CipherSession, CryptoStats, KeyParity};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const PEER_SILENCE_LIMIT: Duration = Duration::from_secs(5);
const ACK_INTERVAL: Duration = Duration::from_millis(10);
const NAK_INTERVAL_FLOOR: Duration = Duration::from_millis(20);
const MAX_NAK_ENTRIES: usize = 100;

/// Connection lifecycle. Transitions are monotone left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    /// Induction exchanged or awaited.
    Induction,
    /// Conclusion sent, awaiting the settling response (caller side).
    Conclusion,
    Established,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Listener,
}

/// Why the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local `close()`.
    Local,
    /// Peer sent Shutdown.
    Remote,
    /// Nothing heard from the peer within the liveness bound.
    PeerSilent,
    /// The handshake failed or timed out.
    Handshake(HandshakeError),
}

/// Work the orchestrator hands back to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Put these bytes on the wire.
    Transmit(Bytes),
    /// Hand this payload to the application, in order.
    Deliver(Bytes),
    /// A message fragment was abandoned after exhausting retransmissions
    /// or its time-to-live.
    SendLoss(SeqNumber),
    /// The connection reached `Shutdown`; no further actions will follow.
    Closed(CloseReason),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("connection is not established")]
    NotEstablished,

    #[error("connection is shut down")]
    Closed,

    #[error("{0}")]
    Send(#[from] SendError),
}

/// Orchestrator-level counters. Monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub data_packets_sent: u64,
    pub data_packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub acks_received: u64,
    pub naks_received: u64,
    pub keepalives_sent: u64,
    pub decode_errors: u64,
    pub protocol_violations: u64,
    pub crypto_drops: u64,
}

impl ConnStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("conn.data_packets_sent", self.data_packets_sent),
            ("conn.data_packets_received", self.data_packets_received),
            ("conn.bytes_sent", self.bytes_sent),
            ("conn.bytes_received", self.bytes_received),
            ("conn.acks_received", self.acks_received),
            ("conn.naks_received", self.naks_received),
            ("conn.keepalives_sent", self.keepalives_sent),
            ("conn.decode_errors", self.decode_errors),
            ("conn.protocol_violations", self.protocol_violations),
            ("conn.crypto_drops", self.crypto_drops),
        ]
    }
}

/// Every component's counters in one snapshot.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub conn: ConnStats,
    pub send: SendStats,
    pub recv: RecvStats,
    pub flow: FlowStats,
    pub congestion: Option<CongestionStats>,
    pub tsbpd: TsbpdStats,
    pub crypto: Option<CryptoStats>,
    pub rtt_smoothed_us: u64,
    pub rtt_variation_us: u64,
}

impl StatsSnapshot {
    /// Flat view keyed by documented counter names.
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        let mut map = self.conn.as_map();
        map.extend(self.send.as_map());
        map.extend(self.recv.as_map());
        map.extend(self.flow.as_map());
        if let Some(congestion) = &self.congestion {
            map.extend(congestion.as_map());
        }
        map.extend(self.tsbpd.as_map());
        if let Some(crypto) = &self.crypto {
            map.extend(crypto.as_map());
        }
        map.push(("rtt.smoothed_us", self.rtt_smoothed_us));
        map.push(("rtt.variation_us", self.rtt_variation_us));
        map
    }
}

/// A single SRT connection, datagrams in, actions out.
pub struct Connection {
    config: SrtConfig,
    role: Role,
    state: State,
    local_socket_id: u32,
    /// ISN announced to the peer during the handshake.
    hs_initial_seq: SeqNumber,
    peer_socket_id: u32,
    session_origin: Instant,
    caller_hs: Option<CallerHandshake>,
    listener_hs: Option<ListenerHandshake>,
    negotiated: Option<Negotiated>,
    cipher: Option<CipherSession>,
    send: Option<SendEngine>,
    recv: Option<ReceiveEngine>,
    tsbpd: Option<TsbpdScheduler>,
    rtt: RttEstimator,
    congestion: CongestionController,
    flow: Option<FlowController>,
    timers: TimerSet,
    /// Send times of recently emitted ACKs, for AckAck round trips.
    ack_times: Vec<(u32, Instant)>,
    last_sent_at: Instant,
    last_heard_at: Instant,
    stats: ConnStats,
}

impl Connection {
    /// Creates the connecting side; the returned action carries the first
    /// Induction, and the retry timer is armed.
    pub fn caller(config: SrtConfig, now: Instant) -> Result<(Self, Vec<Action>), ConnectionError> {
        let mut conn = Self::new(config, Role::Caller, now)?;
        let (machine, induction) = CallerHandshake::start(conn.handshake_config(), now);
        conn.caller_hs = Some(machine);
        conn.state = State::Induction;
        conn.timers
            .schedule("handshake", RETRY_INTERVAL, TimerEvent::HandshakeRetry, now);
        let first = conn.handshake_packet(&induction);
        Ok((conn, vec![first]))
    }

    /// Creates the accepting side; it stays in `Init` until an Induction
    /// arrives.
    pub fn listener(config: SrtConfig, now: Instant) -> Result<Self, ConnectionError> {
        let mut conn = Self::new(config, Role::Listener, now)?;
        conn.listener_hs = Some(ListenerHandshake::new(conn.handshake_config()));
        Ok(conn)
    }

    fn new(config: SrtConfig, role: Role, now: Instant) -> Result<Self, ConnectionError> {
        config.validate()?;
        let mut rng = rand::thread_rng();
        let congestion = CongestionController::new(CongestionConfig {
            mss_bytes: config.mss_bytes,
            max_rate_bps: config.max_bandwidth_bps,
            ..CongestionConfig::default()
        });
        Ok(Connection {
            rtt: RttEstimator::new(config.rto_min(), config.rto_max()),
            congestion,
            local_socket_id: rng.gen_range(1..=u32::MAX),
            hs_initial_seq: SeqNumber::new(rng.gen_range(0..=SEQ_MAX)),
            session_origin: now,
            config,
            role,
            state: State::Init,
            peer_socket_id: 0,
            caller_hs: None,
            listener_hs: None,
            negotiated: None,
            cipher: None,
            send: None,
            recv: None,
            tsbpd: None,
            flow: None,
            timers: TimerSet::new(),
            ack_times: Vec::new(),
            last_sent_at: now,
            last_heard_at: now,
            stats: ConnStats::default(),
        })
    }

    fn handshake_config(&self) -> HandshakeConfig {
        let encryption_salt = self.config.encryption.map(|_| match self.role {
            // the caller proposes the salt; the listener adopts it from
            // the conclusion, the placeholder only marks "required"
            Role::Caller => generate_salt(),
            Role::Listener => [0u8; 16],
        });
        HandshakeConfig {
            local_socket_id: self.local_socket_id,
            initial_seq: self.hs_initial_seq,
            latency_us: self.config.playback_delay_ms * 1000,
            mtu: self.config.mss_bytes as u32,
            flow_window: self.config.initial_recv_window_packets,
            encryption_salt,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_socket_id(&self) -> u32 {
        self.local_socket_id
    }

    pub fn peer_socket_id(&self) -> u32 {
        self.peer_socket_id
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Negotiated session parameters once established.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            conn: self.stats,
            send: self.send.as_ref().map(SendEngine::stats).unwrap_or_default(),
            recv: self.recv.as_ref().map(ReceiveEngine::stats).unwrap_or_default(),
            flow: self.flow.as_ref().map(FlowController::stats).unwrap_or_default(),
            congestion: Some(self.congestion.stats()),
            tsbpd: self.tsbpd.as_ref().map(TsbpdScheduler::stats).unwrap_or_default(),
            crypto: self.cipher.as_ref().map(CipherSession::stats),
            rtt_smoothed_us: self.rtt.smoothed().as_micros() as u64,
            rtt_variation_us: self.rtt.variation().as_micros() as u64,
        }
    }

    /// Microseconds since session origin, wrapping as the wire does.
    fn session_ts(&self, now: Instant) -> u32 {
        now.duration_since(self.session_origin).as_micros() as u32
    }

    /// Earliest instant at which `poll` has work: timers, TSBPD release,
    /// or pacing of the staged send queue.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        let mut deadline = self.timers.time_until_next(now).map(|d| now + d);
        if let Some(release) = self.tsbpd.as_ref().and_then(TsbpdScheduler::next_release) {
            deadline = Some(deadline.map_or(release, |d| d.min(release)));
        }
        let pending_size = self.send.as_ref().and_then(SendEngine::peek_pending_size);
        if let (Some(size), Some(flow)) = (pending_size, self.flow.as_mut()) {
            // cwnd-blocked queues wake on the ACK that opens the window,
            // not on a pacing deadline
            if self.congestion.admits(flow.in_flight()) {
                let at = now + flow.pacing_delay(size, now);
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
            }
        }
        deadline
    }

    // ------------------------------------------------------------------
    // datagram intake
    // ------------------------------------------------------------------

    /// Feeds one received datagram through the connection.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> Vec<Action> {
        if self.state == State::Shutdown {
            return Vec::new();
        }
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.decode_errors += 1;
                debug!(%err, "undecodable datagram dropped");
                return Vec::new();
            }
        };
        self.last_heard_at = now;

        match packet {
            Packet::Control(control) => self.handle_control(control, now),
            Packet::Data(data) => self.handle_data(data, now),
        }
    }

    fn handle_control(&mut self, packet: ControlPacket, now: Instant) -> Vec<Action> {
        match packet.header.kind {
            ControlKind::Handshake => self.handle_handshake(&packet, now),
            ControlKind::Ack => self.handle_ack(&packet, now),
            ControlKind::Nak => self.handle_nak(&packet, now),
            ControlKind::AckAck => {
                self.handle_ackack(packet.header.info, now);
                Vec::new()
            }
            ControlKind::KeepAlive => Vec::new(),
            ControlKind::Shutdown => {
                debug!("peer shut the connection down");
                self.enter_shutdown();
                vec![Action::Closed(CloseReason::Remote)]
            }
            ControlKind::CongestionWarning | ControlKind::DropRequest | ControlKind::PeerError => {
                // recognised but unused; tolerated
                self.stats.protocol_violations += 1;
                Vec::new()
            }
        }
    }

    fn handle_handshake(&mut self, packet: &ControlPacket, now: Instant) -> Vec<Action> {
        let body = match HandshakeBody::decode(&packet.body) {
            Ok(body) => body,
            Err(err) => {
                self.stats.decode_errors += 1;
                debug!(%err, "malformed handshake dropped");
                return Vec::new();
            }
        };

        match self.role {
            Role::Caller => self.handle_handshake_as_caller(body, now),
            Role::Listener => self.handle_handshake_as_listener(body, now),
        }
    }

    fn handle_handshake_as_caller(&mut self, body: HandshakeBody, now: Instant) -> Vec<Action> {
        let Some(machine) = self.caller_hs.as_mut() else {
            self.stats.protocol_violations += 1;
            return Vec::new();
        };
        match machine.handle(body, now) {
            Ok(HandshakeStep::Send(reply)) => {
                self.peer_socket_id = self.caller_hs.as_ref().expect("caller").peer_socket_id();
                self.state = State::Conclusion;
                vec![self.handshake_packet(&reply)]
            }
            Ok(HandshakeStep::Finish(negotiated)) => {
                self.establish(negotiated, now);
                Vec::new()
            }
            Ok(HandshakeStep::SendAndFinish(reply, negotiated)) => {
                let send = self.handshake_packet(&reply);
                self.establish(negotiated, now);
                vec![send]
            }
            Ok(HandshakeStep::Ignored) => {
                self.stats.protocol_violations += 1;
                Vec::new()
            }
            Err(err) => self.fail_handshake(err),
        }
    }

    fn handle_handshake_as_listener(&mut self, body: HandshakeBody, now: Instant) -> Vec<Action> {
        if self.state == State::Init {
            self.state = State::Induction;
        }
        let Some(machine) = self.listener_hs.as_mut() else {
            self.stats.protocol_violations += 1;
            return Vec::new();
        };
        match machine.handle(body, [0u8; 16]) {
            Ok(HandshakeStep::Send(reply)) => vec![self.handshake_packet(&reply)],
            Ok(HandshakeStep::SendAndFinish(reply, negotiated)) => {
                let send = self.handshake_packet(&reply);
                // a re-sent conclusion (our response got lost) only needs
                // the response again; the engines are already running
                if self.state != State::Established {
                    self.establish(negotiated, now);
                }
                vec![send]
            }
            Ok(HandshakeStep::Finish(negotiated)) => {
                if self.state != State::Established {
                    self.establish(negotiated, now);
                }
                Vec::new()
            }
            Ok(HandshakeStep::Ignored) => {
                self.stats.protocol_violations += 1;
                Vec::new()
            }
            Err(err) => {
                let rejection = self
                    .listener_hs
                    .as_ref()
                    .and_then(|m| m.rejection_for(&err))
                    .map(|body| self.handshake_packet(&body));
                let mut actions = self.fail_handshake(err);
                if let Some(rejection) = rejection {
                    actions.insert(0, rejection);
                }
                actions
            }
        }
    }

    fn fail_handshake(&mut self, err: HandshakeError) -> Vec<Action> {
        warn!(%err, "handshake failed");
        self.enter_shutdown();
        vec![Action::Closed(CloseReason::Handshake(err))]
    }

    /// Brings every engine up with the negotiated session parameters.
    fn establish(&mut self, negotiated: Negotiated, now: Instant) {
        self.peer_socket_id = negotiated.peer_socket_id;
        self.session_origin = now;

        if let Some(kind) = self.config.encryption {
            let passphrase = self
                .config
                .passphrase
                .clone()
                .expect("validated: encryption implies passphrase");
            let salt = negotiated
                .key_salt
                .expect("negotiated: encryption implies salt");
            match derive_key(&passphrase, &salt, kind) {
                Ok(key) => {
                    self.cipher = Some(CipherSession::new(
                        passphrase,
                        key,
                        self.config.key_refresh_packets,
                    ));
                }
                Err(err) => {
                    warn!(%err, "key derivation failed");
                    self.enter_shutdown();
                    return;
                }
            }
        }

        let mss = negotiated.mss as usize;
        self.send = Some(SendEngine::new(
            self.hs_initial_seq,
            SendConfig {
                max_payload: mss - HEADER_LEN,
                send_window: self.config.initial_send_window_packets,
                max_retransmits: self.config.max_retransmits,
                rto_max: self.config.rto_max(),
                // live data loses its value a few latencies after capture
                ttl: Some(4 * Duration::from_micros(negotiated.latency_us as u64)),
            },
        ));
        self.recv = Some(ReceiveEngine::new(
            negotiated.peer_initial_seq,
            RecvConfig {
                recv_window: self.config.initial_recv_window_packets,
                ack_frequency: self.config.ack_frequency_packets,
                max_nak_entries: MAX_NAK_ENTRIES,
            },
        ));
        self.tsbpd = Some(TsbpdScheduler::new(
            Duration::from_micros(negotiated.latency_us as u64),
            true,
        ));
        self.flow = Some(FlowController::new(
            self.config.initial_send_window_packets,
            negotiated.peer_flow_window,
            self.config.max_bandwidth_bps,
            now,
        ));

        self.timers.cancel("handshake");
        self.timers
            .schedule("ack", ACK_INTERVAL, TimerEvent::AckTick, now);
        self.timers
            .schedule("nak", NAK_INTERVAL_FLOOR, TimerEvent::NakTick, now);
        self.timers
            .schedule("keepalive", KEEPALIVE_INTERVAL, TimerEvent::Keepalive, now);

        self.negotiated = Some(negotiated);
        self.state = State::Established;
        debug!(
            local = self.local_socket_id,
            peer = self.peer_socket_id,
            "connection established"
        );
    }

    // ------------------------------------------------------------------
    // data path
    // ------------------------------------------------------------------

    fn handle_data(&mut self, packet: DataPacket, now: Instant) -> Vec<Action> {
        if self.state != State::Established {
            self.stats.protocol_violations += 1;
            return Vec::new();
        }
        let header = packet.header;
        let mut payload = packet.payload;

        match (&mut self.cipher, header.key_flag) {
            (Some(cipher), KeyFlag::Even | KeyFlag::Odd | KeyFlag::Both) => {
                let parity = match header.key_flag {
                    KeyFlag::Odd => KeyParity::Odd,
                    _ => KeyParity::Even,
                };
                let mut buf = BytesMut::from(&payload[..]);
                if cipher.decrypt(header.seq.raw(), parity, &mut buf).is_err() {
                    self.stats.crypto_drops += 1;
                    return Vec::new();
                }
                payload = buf.freeze();
            }
            (Some(cipher), KeyFlag::None) => {
                cipher.note_failure();
                self.stats.crypto_drops += 1;
                warn!(seq = %header.seq, "cleartext packet on an encrypted session");
                return Vec::new();
            }
            (None, KeyFlag::None) => {}
            (None, _) => {
                self.stats.crypto_drops += 1;
                warn!(seq = %header.seq, "encrypted packet on a plaintext session");
                return Vec::new();
            }
        }

        self.stats.data_packets_received += 1;
        self.stats.bytes_received += payload.len() as u64;

        let recv = self.recv.as_mut().expect("established");
        let _ = recv.accept(header, payload);
        let ack = recv.ack_due(false);

        let mut actions = Vec::new();
        if let Some(snapshot) = ack {
            actions.push(self.emit_ack(snapshot, now));
        }
        self.schedule_deliveries(now);
        actions
    }

    /// Moves reassembled messages into the TSBPD queue.
    fn schedule_deliveries(&mut self, now: Instant) {
        let (Some(recv), Some(tsbpd)) = (self.recv.as_mut(), self.tsbpd.as_mut()) else {
            return;
        };
        while let Some(message) = recv.pop_message() {
            tsbpd.enqueue(message.seq, message.timestamp, message.payload, now);
        }
    }

    fn handle_ack(&mut self, packet: &ControlPacket, now: Instant) -> Vec<Action> {
        if self.state != State::Established {
            self.stats.protocol_violations += 1;
            return Vec::new();
        }
        self.stats.acks_received += 1;
        let ack_seq = SeqNumber::new(packet.header.info);

        let body = AckBody::decode(&packet.body).unwrap_or_else(|err| {
            self.stats.decode_errors += 1;
            debug!(%err, "malformed ack body");
            None
        });

        let send = self.send.as_mut().expect("established");
        let newly = send.on_ack(ack_seq);
        for seq in &newly {
            self.timers.cancel(&retx_id(*seq));
        }

        if !newly.is_empty() {
            // RTT from the echoed origin timestamp of the newest covered
            // packet; wrapping arithmetic matches the 32-bit wire counter
            if let Some(body) = body {
                let sample = self.session_ts(now).wrapping_sub(body.echo_timestamp);
                if sample < u32::MAX / 2 {
                    self.rtt.record(Duration::from_micros(sample as u64));
                }
            }
            self.congestion.on_ack(self.rtt.smoothed_us());

            let rate = self
                .congestion
                .sending_rate_bps()
                .min(self.config.max_bandwidth_bps);
            // size the window from the measured bandwidth-delay product,
            // floored so the pipeline survives a cold estimator
            let cap = self.config.initial_send_window_packets;
            let suggested = self.rtt.suggested_window(rate).min(cap).max(8.min(cap));
            let flow = self.flow.as_mut().expect("established");
            flow.on_acked(newly.len() as u32);
            flow.set_rate(rate, now);
            flow.set_send_window(suggested);
        }

        // answer the numbered ack so the receiver can measure its side
        let ack_number = packet.header.subtype as u32;
        let mut actions = vec![self.control_packet(ControlKind::AckAck, ack_number, Bytes::new(), now)];
        actions.extend(self.flush(now));
        actions
    }

    fn handle_nak(&mut self, packet: &ControlPacket, now: Instant) -> Vec<Action> {
        if self.state != State::Established {
            self.stats.protocol_violations += 1;
            return Vec::new();
        }
        self.stats.naks_received += 1;
        let body = match NakBody::decode(&packet.body) {
            Ok(body) => body,
            Err(err) => {
                self.stats.decode_errors += 1;
                debug!(%err, "malformed nak body");
                return Vec::new();
            }
        };

        // nothing beyond the send window can legitimately be lost
        let cap = self.config.initial_send_window_packets as usize;
        let lost: Vec<SeqNumber> = body
            .entries
            .iter()
            .flat_map(|entry| entry.sequences())
            .take(cap)
            .collect();
        if lost.is_empty() {
            return Vec::new();
        }

        self.congestion.on_loss(lost.len() as u32, now);
        if let Some(flow) = self.flow.as_mut() {
            flow.on_loss(now);
        }

        let mut actions = Vec::new();
        for seq in lost {
            actions.extend(self.retransmit(seq, now));
        }
        actions
    }

    /// Rebuilds and re-emits one sequence, or surfaces its loss.
    fn retransmit(&mut self, seq: SeqNumber, now: Instant) -> Vec<Action> {
        let send = self.send.as_mut().expect("established");
        match send.retransmit(seq) {
            Ok(chunk) => {
                self.timers.schedule(
                    retx_id(seq),
                    chunk.next_timeout,
                    TimerEvent::Retransmit(seq),
                    now,
                );
                let flow = self.flow.as_mut().expect("established");
                if flow
                    .admit_retransmit(HEADER_LEN + chunk.payload.len(), now)
                    .is_err()
                {
                    // paced out; the re-armed timer tries again
                    return Vec::new();
                }
                self.emit_data(
                    chunk.seq,
                    chunk.message,
                    chunk.position,
                    chunk.ordered,
                    true,
                    chunk.payload,
                    chunk.origin_timestamp,
                    now,
                )
                .into_iter()
                .collect()
            }
            Err(true) => {
                self.timers.cancel(&retx_id(seq));
                if let Some(flow) = self.flow.as_mut() {
                    flow.on_abandoned(1);
                }
                vec![Action::SendLoss(seq)]
            }
            Err(false) => {
                self.timers.cancel(&retx_id(seq));
                Vec::new()
            }
        }
    }

    fn handle_ackack(&mut self, ack_number: u32, now: Instant) {
        if let Some(pos) = self.ack_times.iter().position(|(n, _)| *n == ack_number) {
            let (_, sent_at) = self.ack_times.swap_remove(pos);
            self.rtt.record(now.duration_since(sent_at));
        }
    }

    // ------------------------------------------------------------------
    // application interface
    // ------------------------------------------------------------------

    /// Queues one message and pushes as much of the staged queue to the
    /// wire as the gates allow.
    pub fn send(&mut self, payload: Bytes, now: Instant) -> Result<Vec<Action>, ConnectionError> {
        match self.state {
            State::Established => {}
            State::Shutdown => return Err(ConnectionError::Closed),
            _ => return Err(ConnectionError::NotEstablished),
        }
        let send = self.send.as_mut().expect("established");
        send.enqueue_message(payload, true)?;
        Ok(self.flush(now))
    }

    /// Sends staged chunks while flow and congestion both admit them.
    fn flush(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::Established {
            return actions;
        }
        loop {
            let Some(size) = self.send.as_ref().and_then(SendEngine::peek_pending_size) else {
                break;
            };
            let flow = self.flow.as_mut().expect("established");
            if !self.congestion.admits(flow.in_flight()) {
                break;
            }
            if flow.admit(size, now).is_err() {
                break;
            }
            let rto = self.rtt.rto();
            let origin_ts = self.session_ts(now);
            let chunk = self
                .send
                .as_mut()
                .expect("established")
                .pop_pending(now, rto, origin_ts)
                .expect("peeked entry exists");
            self.congestion.on_packet_sent();
            self.timers.schedule(
                retx_id(chunk.seq),
                rto,
                TimerEvent::Retransmit(chunk.seq),
                now,
            );
            actions.extend(self.emit_data(
                chunk.seq,
                chunk.message,
                chunk.position,
                chunk.ordered,
                false,
                chunk.payload,
                origin_ts,
                now,
            ));
        }
        actions
    }

    /// Drives timers, TSBPD release, and the send queue. Call whenever
    /// `next_deadline` elapses or after feeding datagrams.
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        if self.state == State::Shutdown {
            return Vec::new();
        }
        let mut actions = Vec::new();

        for event in self.timers.tick(now) {
            match event {
                TimerEvent::Retransmit(seq) => {
                    // a timeout is a loss signal, same as a NAK entry
                    if self.send.as_ref().is_some_and(|s| s.is_unacked(seq)) {
                        self.congestion.on_loss(1, now);
                        if let Some(flow) = self.flow.as_mut() {
                            flow.on_loss(now);
                        }
                        actions.extend(self.retransmit(seq, now));
                    }
                }
                TimerEvent::AckTick => {
                    let ack = self.recv.as_mut().and_then(|recv| recv.ack_due(true));
                    if let Some(snapshot) = ack {
                        actions.push(self.emit_ack(snapshot, now));
                    }
                    self.timers
                        .schedule("ack", ACK_INTERVAL, TimerEvent::AckTick, now);
                }
                TimerEvent::NakTick => {
                    let naks = self
                        .recv
                        .as_mut()
                        .map(|recv| recv.nak_due())
                        .unwrap_or_default();
                    for nak in naks {
                        actions.push(self.control_packet(ControlKind::Nak, 0, nak.encode(), now));
                    }
                    let interval = self.rtt.smoothed().max(NAK_INTERVAL_FLOOR);
                    self.timers
                        .schedule("nak", interval, TimerEvent::NakTick, now);
                }
                TimerEvent::Keepalive => {
                    if self.state == State::Established
                        && now.duration_since(self.last_heard_at) >= PEER_SILENCE_LIMIT
                    {
                        warn!("peer silent beyond the liveness bound");
                        self.enter_shutdown();
                        actions.push(Action::Closed(CloseReason::PeerSilent));
                        return actions;
                    }
                    if now.duration_since(self.last_sent_at) >= KEEPALIVE_INTERVAL {
                        self.stats.keepalives_sent += 1;
                        let keepalive =
                            self.control_packet(ControlKind::KeepAlive, 0, Bytes::new(), now);
                        actions.push(keepalive);
                    }
                    self.timers
                        .schedule("keepalive", KEEPALIVE_INTERVAL, TimerEvent::Keepalive, now);
                }
                TimerEvent::HandshakeRetry => {
                    let retry = self.caller_hs.as_mut().map(|machine| machine.on_retry(now));
                    match retry {
                        Some(Ok(Some(body))) => {
                            actions.push(self.handshake_packet(&body));
                            self.timers.schedule(
                                "handshake",
                                RETRY_INTERVAL,
                                TimerEvent::HandshakeRetry,
                                now,
                            );
                        }
                        Some(Ok(None)) | None => {}
                        Some(Err(err)) => {
                            actions.extend(self.fail_handshake(err));
                            return actions;
                        }
                    }
                }
            }
        }

        // abandon stale unacked data (live streams outrun their TTL)
        let expired = self
            .send
            .as_mut()
            .map(|send| send.expire_ttl(now))
            .unwrap_or_default();
        for seq in expired {
            self.timers.cancel(&retx_id(seq));
            if let Some(flow) = self.flow.as_mut() {
                flow.on_abandoned(1);
            }
            actions.push(Action::SendLoss(seq));
        }

        if let Some(tsbpd) = self.tsbpd.as_mut() {
            for (_, payload) in tsbpd.release(now) {
                actions.push(Action::Deliver(payload));
            }
        }

        actions.extend(self.flush(now));
        actions
    }

    /// Closes the connection: announces Shutdown and stops all engines.
    pub fn close(&mut self, now: Instant) -> Vec<Action> {
        if self.state == State::Shutdown {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state == State::Established {
            actions.push(self.control_packet(ControlKind::Shutdown, 0, Bytes::new(), now));
        }
        self.enter_shutdown();
        actions.push(Action::Closed(CloseReason::Local));
        actions
    }

    fn enter_shutdown(&mut self) {
        self.state = State::Shutdown;
        self.timers.cancel_all();
    }

    // ------------------------------------------------------------------
    // packet emission
    // ------------------------------------------------------------------

    fn emit_ack(&mut self, snapshot: AckSnapshot, now: Instant) -> Action {
        let body = AckBody {
            echo_timestamp: snapshot.echo_timestamp,
            rtt_us: self.rtt.smoothed().as_micros() as u32,
            rtt_var_us: self.rtt.variation().as_micros() as u32,
            recv_rate_bps: 0,
        };
        self.ack_times.push((snapshot.ack_number, now));
        if self.ack_times.len() > 128 {
            self.ack_times.remove(0);
        }
        let mut header = ControlHeader::new(
            ControlKind::Ack,
            snapshot.ack_seq.raw(),
            self.session_ts(now),
            self.peer_socket_id,
        );
        header.subtype = snapshot.ack_number as u16;
        self.last_sent_at = now;
        Action::Transmit(
            ControlPacket {
                header,
                body: body.encode(),
            }
            .encode()
            .freeze(),
        )
    }

    fn control_packet(&mut self, kind: ControlKind, info: u32, body: Bytes, now: Instant) -> Action {
        self.last_sent_at = now;
        Action::Transmit(
            ControlPacket {
                header: ControlHeader::new(kind, info, self.session_ts(now), self.peer_socket_id),
                body,
            }
            .encode()
            .freeze(),
        )
    }

    fn handshake_packet(&self, body: &HandshakeBody) -> Action {
        Action::Transmit(
            ControlPacket {
                header: ControlHeader::new(ControlKind::Handshake, 0, 0, self.peer_socket_id),
                body: body.encode(),
            }
            .encode()
            .freeze(),
        )
    }

    /// `origin_timestamp` is the wire timestamp of the chunk's first
    /// transmission; replays repeat it so TSBPD sees origin time.
    #[allow(clippy::too_many_arguments)]
    fn emit_data(
        &mut self,
        seq: SeqNumber,
        message: MessageNumber,
        position: PacketPosition,
        ordered: bool,
        retransmitted: bool,
        payload: Bytes,
        origin_timestamp: u32,
        now: Instant,
    ) -> Option<Action> {
        let mut key_flag = KeyFlag::None;
        let payload = match self.cipher.as_mut() {
            Some(cipher) => {
                let mut buf = BytesMut::from(&payload[..]);
                match cipher.encrypt(seq.raw(), &mut buf) {
                    Ok(KeyParity::Even) => key_flag = KeyFlag::Even,
                    Ok(KeyParity::Odd) => key_flag = KeyFlag::Odd,
                    Err(err) => {
                        // the chunk stays in the unacked ledger; only this
                        // transmission attempt is skipped
                        warn!(%err, "encrypt failed, transmission skipped");
                        self.stats.crypto_drops += 1;
                        return None;
                    }
                }
                buf.freeze()
            }
            None => payload,
        };

        let header = DataHeader {
            seq,
            position,
            ordered,
            key_flag,
            retransmitted,
            message,
            timestamp: origin_timestamp,
            dest_socket_id: self.peer_socket_id,
        };
        self.stats.data_packets_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        self.last_sent_at = now;
        trace!(%seq, retransmitted, "data packet out");
        Some(Action::Transmit(DataPacket { header, payload }.encode().freeze()))
    }
}

fn retx_id(seq: SeqNumber) -> String {
    format!("retx-{}", seq.raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config() -> SrtConfig {
        SrtConfig::default()
    }

    /// Runs the full handshake by shuttling actions between two
    /// connections; panics if either side fails to establish.
    fn establish_pair(
        caller_cfg: SrtConfig,
        listener_cfg: SrtConfig,
        now: Instant,
    ) -> (Connection, Connection) {
        let (mut caller, mut outbound) = Connection::caller(caller_cfg, now).unwrap();
        let mut listener = Connection::listener(listener_cfg, now).unwrap();

        // induction -> response -> conclusion -> response
        for _ in 0..4 {
            let mut next = Vec::new();
            for action in outbound.drain(..) {
                if let Action::Transmit(bytes) = action {
                    next.extend(listener.handle_datagram(&bytes, now));
                }
            }
            std::mem::swap(&mut caller, &mut listener);
            outbound = next;
        }
        // the swap count is even, so roles are back in place
        assert!(caller.is_established(), "caller not established");
        assert!(listener.is_established(), "listener not established");
        (caller, listener)
    }

    fn transmits(actions: &[Action]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Transmit(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let now = Instant::now();
        let (caller, listener) = establish_pair(plain_config(), plain_config(), now);

        assert_eq!(caller.state(), State::Established);
        assert_eq!(listener.state(), State::Established);
        assert_eq!(caller.peer_socket_id(), listener.local_socket_id());
        assert_eq!(listener.peer_socket_id(), caller.local_socket_id());
        assert_eq!(
            caller.negotiated().unwrap().latency_us,
            listener.negotiated().unwrap().latency_us
        );
    }

    #[test]
    fn send_before_establish_is_rejected() {
        let now = Instant::now();
        let (mut caller, _) = Connection::caller(plain_config(), now).unwrap();
        assert_eq!(
            caller.send(Bytes::from_static(b"early"), now).unwrap_err(),
            ConnectionError::NotEstablished
        );
    }

    #[test]
    fn data_roundtrip_delivers_after_playback_delay() {
        let now = Instant::now();
        let (mut caller, mut listener) = establish_pair(plain_config(), plain_config(), now);

        let actions = caller.send(Bytes::from_static(b"live frame"), now).unwrap();
        let packets = transmits(&actions);
        assert_eq!(packets.len(), 1);

        for packet in packets {
            listener.handle_datagram(&packet, now);
        }
        // nothing before the playback delay
        assert!(listener
            .poll(now)
            .iter()
            .all(|a| !matches!(a, Action::Deliver(_))));

        let later = now + Duration::from_millis(120);
        let delivered: Vec<Bytes> = listener
            .poll(later)
            .into_iter()
            .filter_map(|a| match a {
                Action::Deliver(payload) => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![Bytes::from_static(b"live frame")]);
    }

    #[test]
    fn encrypted_session_roundtrips_and_hides_payload() {
        let now = Instant::now();
        let secure = SrtConfig {
            encryption: Some(srt_crypt::CipherKind::Aes256),
            passphrase: Some("my_secret_passphrase".into()),
            ..SrtConfig::default()
        };
        let (mut caller, mut listener) = establish_pair(secure.clone(), secure, now);

        let actions = caller.send(Bytes::from_static(b"secret frame"), now).unwrap();
        let packets = transmits(&actions);
        assert_eq!(packets.len(), 1);
        // ciphertext on the wire
        assert!(!packets[0]
            .windows(b"secret frame".len())
            .any(|w| w == b"secret frame"));

        for packet in packets {
            listener.handle_datagram(&packet, now);
        }
        let later = now + Duration::from_millis(120);
        let delivered: Vec<Bytes> = listener
            .poll(later)
            .into_iter()
            .filter_map(|a| match a {
                Action::Deliver(payload) => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![Bytes::from_static(b"secret frame")]);
    }

    #[test]
    fn ack_cancels_retransmit_and_answers_ackack() {
        let now = Instant::now();
        let (mut caller, mut listener) = establish_pair(plain_config(), plain_config(), now);

        // two messages fit the initial congestion window of 2
        for i in 0..2 {
            let actions = caller.send(Bytes::from(format!("frame {i}")), now).unwrap();
            for packet in transmits(&actions) {
                listener.handle_datagram(&packet, now);
            }
        }
        assert_eq!(caller.stats().send.packets_emitted, 2);

        // the periodic ack timer flushes the cumulative ack out
        let ack_time = now + ACK_INTERVAL;
        let acks = transmits(&listener.poll(ack_time));
        assert!(!acks.is_empty(), "listener never acked");

        let mut ackacks = Vec::new();
        for ack in acks {
            ackacks.extend(transmits(&caller.handle_datagram(&ack, ack_time)));
        }
        let stats = caller.stats();
        assert_eq!(stats.conn.acks_received, 1);
        assert_eq!(stats.send.packets_abandoned, 0);
        assert!(!ackacks.is_empty(), "ack not answered with ackack");
        for ackack in ackacks {
            listener.handle_datagram(&ackack, ack_time);
        }

        // everything acked: nothing left to retransmit or abandon
        let far = now + Duration::from_secs(2);
        assert!(caller
            .poll(far)
            .iter()
            .all(|a| !matches!(a, Action::SendLoss(_))));
    }

    #[test]
    fn shutdown_notifies_peer() {
        let now = Instant::now();
        let (mut caller, mut listener) = establish_pair(plain_config(), plain_config(), now);

        let actions = caller.close(now);
        assert!(actions.contains(&Action::Closed(CloseReason::Local)));

        for packet in transmits(&actions) {
            let events = listener.handle_datagram(&packet, now);
            assert!(events.contains(&Action::Closed(CloseReason::Remote)));
        }
        assert_eq!(listener.state(), State::Shutdown);
        assert_eq!(
            caller.send(Bytes::from_static(b"too late"), now).unwrap_err(),
            ConnectionError::Closed
        );
    }

    #[test]
    fn handshake_retry_times_out() {
        let now = Instant::now();
        let (mut caller, _) = Connection::caller(plain_config(), now).unwrap();

        // nobody answers; walk the retry timer past the deadline
        let mut at = now;
        for _ in 0..30 {
            at += Duration::from_millis(250);
            let actions = caller.poll(at);
            if let Some(Action::Closed(CloseReason::Handshake(err))) = actions
                .iter()
                .find(|a| matches!(a, Action::Closed(_)))
            {
                assert_eq!(*err, HandshakeError::TimedOut);
                assert_eq!(caller.state(), State::Shutdown);
                return;
            }
        }
        panic!("handshake never timed out");
    }

    #[test]
    fn stray_data_before_establish_counts_violation() {
        let now = Instant::now();
        let mut listener = Connection::listener(plain_config(), now).unwrap();
        let stray = DataPacket {
            header: DataHeader {
                seq: SeqNumber::new(1),
                position: PacketPosition::Only,
                ordered: false,
                key_flag: KeyFlag::None,
                retransmitted: false,
                message: MessageNumber::new(0),
                timestamp: 0,
                dest_socket_id: 0,
            },
            payload: Bytes::from_static(b"stray"),
        };
        assert!(listener.handle_datagram(&stray.encode(), now).is_empty());
        assert_eq!(listener.stats().conn.protocol_violations, 1);
    }
}
