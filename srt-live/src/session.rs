//! Blocking session API over the single-threaded reactor.
//!
//! Each session spawns one reactor thread that exclusively owns the UDP
//! socket and the protocol state. The application handle shares only an
//! intent queue and a delivery queue with it; `send` posts an intent,
//! `recv` blocks on the delivery queue. This keeps the protocol core
//! lock-free while the boundary stays thread-safe.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use srt_net::UdpEndpoint;
use srt_proto::{
    Action, CloseReason, Connection, ConnectionError, SendError, SrtConfig, StatsSnapshot,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Longest single socket wait; bounds intent-queue latency.
const POLL_CAP: Duration = Duration::from_millis(100);

/// Pending messages the handle may stage before `send` reports pressure.
const INTENT_CAP: usize = 1024;

const ESTABLISH_WAIT: Duration = Duration::from_secs(6);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Socket(#[from] srt_net::SocketError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("connection closed: {0:?}")]
    Closed(CloseReason),

    #[error("the intent queue is full, retry later")]
    WouldBlock,

    #[error("connection did not establish in time")]
    EstablishTimeout,
}

enum Intent {
    Send(Bytes),
    Close,
}

#[derive(Default)]
struct SharedState {
    intents: VecDeque<Intent>,
    delivered: VecDeque<Bytes>,
    established: bool,
    closed: Option<CloseReason>,
    send_losses: u64,
    stats: StatsSnapshot,
}

struct Shared {
    state: Mutex<SharedState>,
    wakeup: Condvar,
}

/// One SRT connection usable from application threads.
pub struct SrtSession {
    shared: Arc<Shared>,
    reactor: Option<JoinHandle<()>>,
}

impl SrtSession {
    /// Connects to a listening peer and blocks until established.
    pub fn connect(
        local: SocketAddr,
        peer: SocketAddr,
        config: SrtConfig,
    ) -> Result<Self, SessionError> {
        let socket = UdpEndpoint::bind(local)?;
        let now = Instant::now();
        let (connection, actions) = Connection::caller(config, now)?;
        Self::spawn(socket, peer, connection, actions, now)
    }

    /// Waits for a caller on `local` and blocks until established.
    pub fn accept(local: SocketAddr, config: SrtConfig) -> Result<Self, SessionError> {
        let socket = UdpEndpoint::bind(local)?;
        let now = Instant::now();
        let connection = Connection::listener(config, now)?;
        Self::spawn_listener(socket, connection)
    }

    fn spawn(
        socket: UdpEndpoint,
        peer: SocketAddr,
        connection: Connection,
        initial: Vec<Action>,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState::default()),
            wakeup: Condvar::new(),
        });
        let reactor_shared = shared.clone();
        let reactor = std::thread::Builder::new()
            .name("srt-reactor".into())
            .spawn(move || {
                let mut reactor = Reactor {
                    socket,
                    peer: Some(peer),
                    connection,
                    shared: reactor_shared,
                };
                reactor.route(initial);
                reactor.run();
            })
            .expect("reactor thread spawn");

        let session = SrtSession {
            shared,
            reactor: Some(reactor),
        };
        session.wait_established()?;
        Ok(session)
    }

    fn spawn_listener(socket: UdpEndpoint, connection: Connection) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState::default()),
            wakeup: Condvar::new(),
        });
        let reactor_shared = shared.clone();
        let reactor = std::thread::Builder::new()
            .name("srt-reactor".into())
            .spawn(move || {
                let mut reactor = Reactor {
                    socket,
                    peer: None,
                    connection,
                    shared: reactor_shared,
                };
                reactor.run();
            })
            .expect("reactor thread spawn");

        let session = SrtSession {
            shared,
            reactor: Some(reactor),
        };
        session.wait_established()?;
        Ok(session)
    }

    fn wait_established(&self) -> Result<(), SessionError> {
        let deadline = Instant::now() + ESTABLISH_WAIT;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(reason) = &state.closed {
                return Err(SessionError::Closed(reason.clone()));
            }
            if state.established {
                return Ok(());
            }
            if self
                .shared
                .wakeup
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(SessionError::EstablishTimeout);
            }
        }
    }

    /// Stages one message for transmission. Fails fast when the session
    /// is closed or the staging queue is saturated.
    pub fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        if let Some(reason) = &state.closed {
            return Err(SessionError::Closed(reason.clone()));
        }
        if state.intents.len() >= INTENT_CAP {
            return Err(SessionError::WouldBlock);
        }
        state.intents.push_back(Intent::Send(payload));
        Ok(())
    }

    /// Blocks up to `timeout` for the next delivered message.
    ///
    /// `Ok(None)` on timeout; `Err(Closed)` once the connection is gone
    /// and every delivered message has been drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Bytes>, SessionError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(payload) = state.delivered.pop_front() {
                return Ok(Some(payload));
            }
            if let Some(reason) = &state.closed {
                return Err(SessionError::Closed(reason.clone()));
            }
            if self
                .shared
                .wakeup
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    /// Messages abandoned by the sender after exhausting retransmissions.
    pub fn send_losses(&self) -> u64 {
        self.shared.state.lock().send_losses
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.state.lock().stats.clone()
    }

    /// Closes the connection and waits for the reactor to wind down.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed.is_none() {
                state.intents.push_back(Intent::Close);
            }
        }
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SrtSession {
    fn drop(&mut self) {
        self.close_inner();
    }
}

/// The event loop; exclusive owner of socket and connection.
struct Reactor {
    socket: UdpEndpoint,
    peer: Option<SocketAddr>,
    connection: Connection,
    shared: Arc<Shared>,
}

impl Reactor {
    fn run(&mut self) {
        let mut buf = vec![0u8; 65536];
        loop {
            let now = Instant::now();

            // 1. application intents
            let intents: Vec<Intent> = {
                let mut state = self.shared.state.lock();
                state.intents.drain(..).collect()
            };
            let mut done = false;
            for intent in intents {
                match intent {
                    Intent::Send(payload) => match self.connection.send(payload.clone(), now) {
                        Ok(actions) => self.route(actions),
                        Err(ConnectionError::Send(SendError::WouldBlock)) => {
                            // window pressure: keep it staged for later
                            self.shared.state.lock().intents.push_front(Intent::Send(payload));
                            break;
                        }
                        Err(err) => {
                            debug!(%err, "send intent dropped");
                        }
                    },
                    Intent::Close => {
                        let actions = self.connection.close(now);
                        self.route(actions);
                        done = true;
                    }
                }
            }
            if done || self.is_closed() {
                break;
            }

            // 2. bounded wait on the socket
            let timeout = self
                .connection
                .next_deadline(now)
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(POLL_CAP)
                .min(POLL_CAP);
            match self.socket.recv_timeout(&mut buf, timeout) {
                Ok(Some((len, from))) => {
                    // the first datagram pins the peer (listener side)
                    let peer = *self.peer.get_or_insert(from);
                    if from == peer {
                        let at = Instant::now();
                        let actions = self.connection.handle_datagram(&buf[..len], at);
                        self.route(actions);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "socket receive failed");
                }
            }

            // 3. timers, delivery, send queue
            let now = Instant::now();
            let actions = self.connection.poll(now);
            self.route(actions);

            {
                let mut state = self.shared.state.lock();
                state.stats = self.connection.stats();
            }
            if self.is_closed() {
                break;
            }
        }
        self.shared.wakeup.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    fn route(&mut self, actions: Vec<Action>) {
        let mut notify = false;
        for action in actions {
            match action {
                Action::Transmit(datagram) => {
                    let result = match self.peer {
                        Some(peer) => self.socket.send_to(&datagram, peer),
                        None => Ok(0),
                    };
                    if let Err(err) = result {
                        warn!(%err, "transmit failed");
                    }
                }
                Action::Deliver(payload) => {
                    let mut state = self.shared.state.lock();
                    state.delivered.push_back(payload);
                    notify = true;
                }
                Action::SendLoss(seq) => {
                    debug!(%seq, "message fragment abandoned");
                    self.shared.state.lock().send_losses += 1;
                }
                Action::Closed(reason) => {
                    let mut state = self.shared.state.lock();
                    state.closed = Some(reason);
                    notify = true;
                }
            }
        }
        if self.connection.is_established() {
            let mut state = self.shared.state.lock();
            if !state.established {
                state.established = true;
                notify = true;
            }
        }
        if notify {
            self.shared.wakeup.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> SocketAddr {
        // bind to an ephemeral port and release it for the session
        let probe = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        probe.local_addr().unwrap()
    }

    fn wild() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn loopback_transfer() {
        let listener_addr = free_addr();
        let config = SrtConfig::default();

        let accept_cfg = config.clone();
        let acceptor =
            std::thread::spawn(move || SrtSession::accept(listener_addr, accept_cfg).unwrap());

        let caller = SrtSession::connect(wild(), listener_addr, config).unwrap();
        let listener = acceptor.join().unwrap();

        caller.send(Bytes::from_static(b"first")).unwrap();
        caller.send(Bytes::from_static(b"second")).unwrap();

        let a = listener
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("first message");
        let b = listener
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("second message");
        assert_eq!(&a[..], b"first");
        assert_eq!(&b[..], b"second");

        caller.close();
        listener.close();
    }

    #[test]
    fn encrypted_loopback_transfer() {
        let listener_addr = free_addr();
        let config = SrtConfig {
            encryption: Some(srt_crypt::CipherKind::Aes256),
            passphrase: Some("correct horse battery".into()),
            ..SrtConfig::default()
        };

        let accept_cfg = config.clone();
        let acceptor =
            std::thread::spawn(move || SrtSession::accept(listener_addr, accept_cfg).unwrap());
        let caller = SrtSession::connect(wild(), listener_addr, config).unwrap();
        let listener = acceptor.join().unwrap();

        caller.send(Bytes::from_static(b"sealed")).unwrap();
        let got = listener
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("message");
        assert_eq!(&got[..], b"sealed");

        caller.close();
        listener.close();
    }

    #[test]
    fn recv_times_out_quietly() {
        let listener_addr = free_addr();
        let config = SrtConfig::default();

        let accept_cfg = config.clone();
        let acceptor =
            std::thread::spawn(move || SrtSession::accept(listener_addr, accept_cfg).unwrap());
        let caller = SrtSession::connect(wild(), listener_addr, config).unwrap();
        let listener = acceptor.join().unwrap();

        let got = listener.recv_timeout(Duration::from_millis(50)).unwrap();
        assert!(got.is_none());

        caller.close();
        listener.close();
    }
}
