//! Two-phase connection handshake.
//!
//! The caller first sends an Induction carrying no extensions; the
//! listener answers with its socket id. The caller then sends a Conclusion
//! whose extension block negotiates SRT version, encryption, and latency,
//! and the listener's Response settles the session parameters. Negotiated
//! latency is the maximum of the two sides' requests. Rejections travel as
//! negative handshake type codes and never leave partial state behind.

use crate::packet::CodecError;
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Local SRT version, 0x00MMmmpp.
pub const SRT_VERSION: u32 = 0x00010405;

/// Oldest peer version accepted (1.3.0).
pub const MIN_PEER_VERSION: u32 = 0x00010300;

/// Extension-field marker present once SRT extensions are attached.
pub const EXT_MAGIC: u16 = 0x4A17;

/// Wire value of the encryption field when a cipher is configured.
pub const ENC_FIELD_AES: u16 = 2;

/// Accepted latency range, microseconds.
pub const LATENCY_MIN_US: u32 = 20_000;
pub const LATENCY_MAX_US: u32 = 8_000_000;

/// Handshake retry cadence and overall bound.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);
pub const RETRY_DEADLINE: Duration = Duration::from_secs(5);

const FIXED_LEN: usize = 44;
const SALT_LEN: usize = 16;

/// SRT_FLAGS bit 0: payload encryption active.
const FLAG_ENCRYPT: u32 = 1 << 0;

/// Why a handshake was refused. The discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RejectReason {
    Version = -1000,
    Encryption = -1001,
    Latency = -1002,
    Unsupported = -1003,
}

impl RejectReason {
    fn from_wire(code: i32) -> Self {
        match code {
            -1000 => RejectReason::Version,
            -1001 => RejectReason::Encryption,
            -1002 => RejectReason::Latency,
            _ => RejectReason::Unsupported,
        }
    }
}

/// Handshake phase discriminator carried in the wire body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    Induction,
    Conclusion,
    Response,
    Rejection(RejectReason),
}

impl HandshakeType {
    fn wire(self) -> i32 {
        match self {
            HandshakeType::Induction => 1,
            HandshakeType::Conclusion => -1,
            HandshakeType::Response => 0,
            HandshakeType::Rejection(reason) => reason as i32,
        }
    }

    fn from_wire(code: i32) -> Result<Self, CodecError> {
        match code {
            1 => Ok(HandshakeType::Induction),
            -1 => Ok(HandshakeType::Conclusion),
            0 => Ok(HandshakeType::Response),
            c if c <= -1000 => Ok(HandshakeType::Rejection(RejectReason::from_wire(c))),
            c => Err(CodecError::FieldRange {
                field: "handshake_type",
                value: c as u32 as u64,
                max: 1,
            }),
        }
    }
}

/// One extension record of the handshake body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    SrtVersion(u32),
    /// Capability bits; bit 0 requests encryption.
    Flags(u32),
    /// Requested TSBPD delay, microseconds.
    TsbpdDelay(u32),
    /// Latency the peer will apply on its receiving side, microseconds.
    PeerLatency(u32),
    /// PBKDF2 salt for the session key.
    KeySalt([u8; SALT_LEN]),
}

impl Extension {
    fn type_code(&self) -> u16 {
        match self {
            Extension::SrtVersion(_) => 1,
            Extension::Flags(_) => 2,
            Extension::TsbpdDelay(_) => 3,
            Extension::PeerLatency(_) => 4,
            Extension::KeySalt(_) => 5,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.type_code());
        match self {
            Extension::SrtVersion(v)
            | Extension::Flags(v)
            | Extension::TsbpdDelay(v)
            | Extension::PeerLatency(v) => {
                buf.put_u16(4);
                buf.put_u32(*v);
            }
            Extension::KeySalt(salt) => {
                buf.put_u16(SALT_LEN as u16);
                buf.put_slice(salt);
            }
        }
    }
}

/// The handshake control packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeBody {
    pub version: u32,
    /// 0 when plaintext, [`ENC_FIELD_AES`] when a cipher is configured.
    pub encryption_field: u16,
    /// [`EXT_MAGIC`] once extensions are present, 0 otherwise.
    pub extension_field: u16,
    pub initial_seq: SeqNumber,
    pub mtu: u32,
    pub max_flow_window: u32,
    pub handshake_type: HandshakeType,
    pub socket_id: u32,
    /// Peer address echo; 16 bytes, IPv4 occupies the first four.
    pub peer_ip: [u8; 16],
    pub extensions: Vec<Extension>,
}

impl HandshakeBody {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.extensions.len() * 20);
        buf.put_u32(self.version);
        buf.put_u16(self.encryption_field);
        buf.put_u16(if self.extensions.is_empty() {
            self.extension_field
        } else {
            EXT_MAGIC
        });
        buf.put_u32(self.initial_seq.raw());
        buf.put_u32(self.mtu);
        buf.put_u32(self.max_flow_window);
        buf.put_i32(self.handshake_type.wire());
        buf.put_u32(self.socket_id);
        buf.put_slice(&self.peer_ip);
        for ext in &self.extensions {
            let before = buf.len();
            ext.encode(&mut buf);
            // pad each record's value to a 4-byte multiple
            while (buf.len() - before) % 4 != 0 {
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        if body.len() < FIXED_LEN {
            return Err(CodecError::ShortBody {
                context: "handshake",
                need: FIXED_LEN,
                have: body.len(),
            });
        }
        let version = body.get_u32();
        let encryption_field = body.get_u16();
        let extension_field = body.get_u16();
        let initial_seq_raw = body.get_u32();
        if initial_seq_raw > crate::sequence::SEQ_MAX {
            return Err(CodecError::FieldRange {
                field: "initial_seq",
                value: initial_seq_raw as u64,
                max: crate::sequence::SEQ_MAX as u64,
            });
        }
        let mtu = body.get_u32();
        let max_flow_window = body.get_u32();
        let handshake_type = HandshakeType::from_wire(body.get_i32())?;
        let socket_id = body.get_u32();
        let mut peer_ip = [0u8; 16];
        body.copy_to_slice(&mut peer_ip);

        let mut extensions = Vec::new();
        while body.remaining() >= 4 {
            let type_code = body.get_u16();
            let len = body.get_u16() as usize;
            let padded = len.div_ceil(4) * 4;
            if body.remaining() < padded {
                return Err(CodecError::ShortBody {
                    context: "handshake extension",
                    need: padded,
                    have: body.remaining(),
                });
            }
            let value = &body[..len];
            let ext = match type_code {
                1 if len == 4 => Some(Extension::SrtVersion(u32::from_be_bytes(
                    value.try_into().expect("length checked"),
                ))),
                2 if len == 4 => Some(Extension::Flags(u32::from_be_bytes(
                    value.try_into().expect("length checked"),
                ))),
                3 if len == 4 => Some(Extension::TsbpdDelay(u32::from_be_bytes(
                    value.try_into().expect("length checked"),
                ))),
                4 if len == 4 => Some(Extension::PeerLatency(u32::from_be_bytes(
                    value.try_into().expect("length checked"),
                ))),
                5 if len == SALT_LEN => {
                    let mut salt = [0u8; SALT_LEN];
                    salt.copy_from_slice(value);
                    Some(Extension::KeySalt(salt))
                }
                // unknown or malformed records are skipped, not fatal
                _ => None,
            };
            if let Some(ext) = ext {
                extensions.push(ext);
            }
            body.advance(padded);
        }

        Ok(HandshakeBody {
            version,
            encryption_field,
            extension_field,
            initial_seq: SeqNumber::new(initial_seq_raw),
            mtu,
            max_flow_window,
            handshake_type,
            socket_id,
            peer_ip,
            extensions,
        })
    }

    fn find_u32(&self, pick: impl Fn(&Extension) -> Option<u32>) -> Option<u32> {
        self.extensions.iter().find_map(pick)
    }

    pub fn tsbpd_delay_us(&self) -> Option<u32> {
        self.find_u32(|e| match e {
            Extension::TsbpdDelay(v) => Some(*v),
            _ => None,
        })
    }

    pub fn flags(&self) -> Option<u32> {
        self.find_u32(|e| match e {
            Extension::Flags(v) => Some(*v),
            _ => None,
        })
    }

    pub fn srt_version(&self) -> Option<u32> {
        self.find_u32(|e| match e {
            Extension::SrtVersion(v) => Some(*v),
            _ => None,
        })
    }

    pub fn key_salt(&self) -> Option<[u8; SALT_LEN]> {
        self.extensions.iter().find_map(|e| match e {
            Extension::KeySalt(salt) => Some(*salt),
            _ => None,
        })
    }
}

/// Fatal handshake outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("peer version {0:#08x} older than supported {MIN_PEER_VERSION:#08x}")]
    VersionTooOld(u32),

    #[error("encryption requirement mismatch (local {local}, peer {peer})")]
    EncryptionMismatch { local: bool, peer: bool },

    #[error("negotiated latency {0} us outside {LATENCY_MIN_US}..={LATENCY_MAX_US}")]
    LatencyOutOfRange(u32),

    #[error("peer rejected the handshake: {0:?}")]
    Rejected(RejectReason),

    #[error("conclusion carries no SRT extensions")]
    MissingExtensions,

    #[error("handshake gave up after {}s", RETRY_DEADLINE.as_secs())]
    TimedOut,

    #[error("malformed handshake body: {0}")]
    Codec(#[from] CodecError),
}

impl HandshakeError {
    /// Wire code to put into an outgoing rejection, if one applies.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            HandshakeError::VersionTooOld(_) => Some(RejectReason::Version),
            HandshakeError::EncryptionMismatch { .. } => Some(RejectReason::Encryption),
            HandshakeError::LatencyOutOfRange(_) => Some(RejectReason::Latency),
            _ => None,
        }
    }
}

/// Everything both sides agree on once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub peer_socket_id: u32,
    pub peer_initial_seq: SeqNumber,
    /// max(local request, peer request), microseconds.
    pub latency_us: u32,
    /// Salt of the session key when encryption was agreed.
    pub key_salt: Option<[u8; SALT_LEN]>,
    pub peer_flow_window: u32,
    /// min(local, peer) segment size.
    pub mss: u32,
}

/// Local parameters feeding the handshake machines.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub local_socket_id: u32,
    pub initial_seq: SeqNumber,
    pub latency_us: u32,
    pub mtu: u32,
    pub flow_window: u32,
    /// Salt to offer (caller) or adopt-and-echo (listener) when
    /// encrypting; `None` negotiates a plaintext session.
    pub encryption_salt: Option<[u8; SALT_LEN]>,
}

impl HandshakeConfig {
    fn encrypting(&self) -> bool {
        self.encryption_salt.is_some()
    }

    fn enc_field(&self) -> u16 {
        if self.encrypting() {
            ENC_FIELD_AES
        } else {
            0
        }
    }

    fn conclusion_extensions(&self, latency_us: u32) -> Vec<Extension> {
        let mut exts = vec![
            Extension::SrtVersion(SRT_VERSION),
            Extension::Flags(if self.encrypting() { FLAG_ENCRYPT } else { 0 }),
            Extension::TsbpdDelay(latency_us),
            Extension::PeerLatency(latency_us),
        ];
        if let Some(salt) = self.encryption_salt {
            exts.push(Extension::KeySalt(salt));
        }
        exts
    }

    fn body(&self, handshake_type: HandshakeType, extensions: Vec<Extension>) -> HandshakeBody {
        HandshakeBody {
            version: SRT_VERSION,
            encryption_field: if extensions.is_empty() { 0 } else { self.enc_field() },
            extension_field: 0,
            initial_seq: self.initial_seq,
            mtu: self.mtu,
            max_flow_window: self.flow_window,
            handshake_type,
            socket_id: self.local_socket_id,
            peer_ip: [0u8; 16],
            extensions,
        }
    }
}

/// What a handshake machine wants done after consuming a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Transmit this body.
    Send(HandshakeBody),
    /// Transmit this body; the connection is now established.
    SendAndFinish(HandshakeBody, Negotiated),
    /// The connection is established, nothing to transmit.
    Finish(Negotiated),
    /// Not relevant in the current state; dropped and counted upstream.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallerPhase {
    AwaitInductionReply,
    AwaitConclusionReply,
    Done,
}

/// Caller (connecting) half of the handshake.
pub struct CallerHandshake {
    config: HandshakeConfig,
    phase: CallerPhase,
    started: Instant,
    /// Last body sent, re-sent verbatim on the retry timer.
    outgoing: HandshakeBody,
    peer_socket_id: u32,
}

impl CallerHandshake {
    /// Returns the machine and the Induction to send first.
    pub fn start(config: HandshakeConfig, now: Instant) -> (Self, HandshakeBody) {
        let induction = config.body(HandshakeType::Induction, Vec::new());
        let machine = CallerHandshake {
            config,
            phase: CallerPhase::AwaitInductionReply,
            started: now,
            outgoing: induction.clone(),
            peer_socket_id: 0,
        };
        (machine, induction)
    }

    pub fn is_done(&self) -> bool {
        self.phase == CallerPhase::Done
    }

    /// Peer socket id once the induction reply has arrived.
    pub fn peer_socket_id(&self) -> u32 {
        self.peer_socket_id
    }

    pub fn handle(&mut self, body: HandshakeBody, _now: Instant) -> Result<HandshakeStep, HandshakeError> {
        if let HandshakeType::Rejection(reason) = body.handshake_type {
            return Err(HandshakeError::Rejected(reason));
        }

        match (self.phase, body.handshake_type) {
            (CallerPhase::AwaitInductionReply, HandshakeType::Response) => {
                self.peer_socket_id = body.socket_id;
                debug!(peer = body.socket_id, "induction answered, sending conclusion");

                let exts = self.config.conclusion_extensions(self.config.latency_us);
                let conclusion = self.config.body(HandshakeType::Conclusion, exts);
                self.outgoing = conclusion.clone();
                self.phase = CallerPhase::AwaitConclusionReply;
                Ok(HandshakeStep::Send(conclusion))
            }
            (CallerPhase::AwaitConclusionReply, HandshakeType::Response) => {
                if body.srt_version().is_none() {
                    return Err(HandshakeError::MissingExtensions);
                }
                let peer_latency = body.tsbpd_delay_us().unwrap_or(0);
                let latency_us = peer_latency.max(self.config.latency_us);
                check_latency(latency_us)?;

                let peer_encrypting = body.flags().unwrap_or(0) & FLAG_ENCRYPT != 0;
                if peer_encrypting != self.config.encrypting() {
                    return Err(HandshakeError::EncryptionMismatch {
                        local: self.config.encrypting(),
                        peer: peer_encrypting,
                    });
                }

                self.phase = CallerPhase::Done;
                debug!(latency_us, "handshake concluded");
                Ok(HandshakeStep::Finish(Negotiated {
                    peer_socket_id: body.socket_id,
                    peer_initial_seq: body.initial_seq,
                    latency_us,
                    key_salt: self.config.encryption_salt,
                    peer_flow_window: body.max_flow_window,
                    mss: body.mtu.min(self.config.mtu),
                }))
            }
            _ => Ok(HandshakeStep::Ignored),
        }
    }

    /// Retry tick: re-send the current body, or time the handshake out.
    pub fn on_retry(&mut self, now: Instant) -> Result<Option<HandshakeBody>, HandshakeError> {
        if self.phase == CallerPhase::Done {
            return Ok(None);
        }
        if now.duration_since(self.started) >= RETRY_DEADLINE {
            warn!("handshake retry deadline exceeded");
            return Err(HandshakeError::TimedOut);
        }
        Ok(Some(self.outgoing.clone()))
    }
}

/// Listener (accepting) half of the handshake.
pub struct ListenerHandshake {
    config: HandshakeConfig,
    done: bool,
}

impl ListenerHandshake {
    pub fn new(config: HandshakeConfig) -> Self {
        ListenerHandshake {
            config,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consumes a caller packet. Validation failures return the error and
    /// the caller-facing rejection is built by [`Self::rejection_for`].
    pub fn handle(
        &mut self,
        body: HandshakeBody,
        peer_ip: [u8; 16],
    ) -> Result<HandshakeStep, HandshakeError> {
        match body.handshake_type {
            HandshakeType::Induction => {
                debug!(peer = body.socket_id, "induction received");
                let mut reply = self.config.body(HandshakeType::Response, Vec::new());
                reply.peer_ip = peer_ip;
                Ok(HandshakeStep::Send(reply))
            }
            HandshakeType::Conclusion => {
                if body.srt_version().is_none() {
                    return Err(HandshakeError::MissingExtensions);
                }
                let peer_version = body.srt_version().expect("checked above");
                if peer_version < MIN_PEER_VERSION {
                    return Err(HandshakeError::VersionTooOld(peer_version));
                }

                let peer_encrypting = body.flags().unwrap_or(0) & FLAG_ENCRYPT != 0;
                if peer_encrypting != self.config.encrypting() {
                    return Err(HandshakeError::EncryptionMismatch {
                        local: self.config.encrypting(),
                        peer: peer_encrypting,
                    });
                }

                let peer_latency = body.tsbpd_delay_us().unwrap_or(0);
                let latency_us = peer_latency.max(self.config.latency_us);
                check_latency(latency_us)?;

                // adopt the caller's salt for the shared key schedule
                let key_salt = if peer_encrypting { body.key_salt() } else { None };
                if peer_encrypting && key_salt.is_none() {
                    return Err(HandshakeError::MissingExtensions);
                }

                let negotiated = Negotiated {
                    peer_socket_id: body.socket_id,
                    peer_initial_seq: body.initial_seq,
                    latency_us,
                    key_salt,
                    peer_flow_window: body.max_flow_window,
                    mss: body.mtu.min(self.config.mtu),
                };

                let mut config = self.config.clone();
                config.encryption_salt = key_salt;
                let mut exts = config.conclusion_extensions(latency_us);
                exts.retain(|e| !matches!(e, Extension::KeySalt(_)));
                let reply = config.body(HandshakeType::Response, exts);

                self.done = true;
                debug!(latency_us, "conclusion accepted");
                Ok(HandshakeStep::SendAndFinish(reply, negotiated))
            }
            _ => Ok(HandshakeStep::Ignored),
        }
    }

    /// Builds the wire rejection for a validation error, when one applies.
    pub fn rejection_for(&self, error: &HandshakeError) -> Option<HandshakeBody> {
        error.reject_reason().map(|reason| {
            self.config
                .body(HandshakeType::Rejection(reason), Vec::new())
        })
    }
}

fn check_latency(latency_us: u32) -> Result<(), HandshakeError> {
    if !(LATENCY_MIN_US..=LATENCY_MAX_US).contains(&latency_us) {
        return Err(HandshakeError::LatencyOutOfRange(latency_us));
    }
    Ok(())
}
