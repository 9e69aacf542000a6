//! UDP hole-punching session.
//!
//! ### State machine
//! ```text
//! Idle -> Registering -> AwaitingPeer -> Punching -> Established
//!                             |             |             |
//!                             +-------------+-------------+--> Closed(ok | error)
//! ```
//! `Idle`, `Registering` and `AwaitingPeer` are published by
//! [`crate::agent::Agent`]; this module owns `Punching` onwards.
//!
//! While punching, a background task sends a HELLO to the peer every
//! keepalive interval and the foreground loop receives on the same connected
//! socket. Receiving a HELLO is answered with an ACK carrying its nonce;
//! receiving an ACK for our own nonce means both directions work and the
//! session becomes `Established`.
//!
//! The session ends when the shutdown future resolves (ok) or on the first
//! send/receive error (error). Either way the keepalive task is told to stop
//! and joined before `run` returns, so nothing is sent afterwards.

use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, SessionError};
use crate::metrics::Metrics;
use crate::protocol::{Ack, Hello, PunchMessage};

const RECV_BUFFER_SIZE: usize = 2048;

/// Lifecycle of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registering,
    AwaitingPeer,
    Punching,
    /// The peer acknowledged one of our HELLOs
    Established,
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Registering => write!(f, "registering"),
            SessionState::AwaitingPeer => write!(f, "awaiting peer"),
            SessionState::Punching => write!(f, "punching"),
            SessionState::Established => write!(f, "established"),
            SessionState::Closed(CloseReason::Shutdown) => write!(f, "closed"),
            SessionState::Closed(CloseReason::Failed(kind)) => {
                write!(f, "closed ({:?} error)", kind)
            }
        }
    }
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Shutdown was requested
    Shutdown,
    Failed(ErrorKind),
}

/// Local identity a session announces in its HELLOs.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub id: String,
    /// Port to bind on all interfaces
    pub port: u16,
    /// What the registry has for us
    pub advertised: SocketAddr,
}

/// Summary handed back to the driver when a session ends.
#[derive(Debug)]
pub struct SessionReport {
    pub peer_id: String,
    pub peer_addr: SocketAddr,
    pub state: SessionState,
    pub established: bool,
    pub keepalives_sent: u64,
    pub datagrams_received: u64,
    pub result: Result<(), SessionError>,
}

/// A bound, connected socket ready to punch towards one peer.
pub struct PunchSession {
    local: LocalEndpoint,
    peer_id: String,
    peer_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    keepalive_interval: Duration,
    nonce: [u8; 12],
    metrics: Arc<Metrics>,
    state: watch::Sender<SessionState>,
    established: bool,
    datagrams_received: u64,
}

impl PunchSession {
    /// Bind the local port and set `peer_addr` as default destination.
    pub async fn open(
        local: LocalEndpoint,
        peer_id: &str,
        peer_addr: SocketAddr,
        keepalive_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SessionError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], local.port));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        socket
            .connect(peer_addr)
            .await
            .map_err(|source| SessionError::Connect {
                addr: peer_addr.to_string(),
                source,
            })?;

        let (state, _) = watch::channel(SessionState::AwaitingPeer);

        Ok(Self {
            local,
            peer_id: peer_id.to_string(),
            peer_addr,
            socket: Arc::new(socket),
            keepalive_interval,
            nonce: rand::random(),
            metrics,
            state,
            established: false,
            datagrams_received: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Follow state changes while the session runs.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        info!("Session with {} ({}): {}", self.peer_id, self.peer_addr, state);
        self.state.send_replace(state);
    }

    /// Punch until `shutdown` resolves or the socket fails.
    pub async fn run<F>(mut self, shutdown: F) -> SessionReport
    where
        F: Future<Output = ()>,
    {
        let hello = PunchMessage::Hello(Hello {
            sender_id: self.local.id.clone(),
            sender_addr: self.local.advertised.to_string(),
            nonce: self.nonce,
        });
        let hello = match hello.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = SessionError::Protocol(e.to_string());
                self.metrics.inc_sessions_failed();
                return self.finish(Err(err), 0);
            }
        };

        self.metrics.session_started();
        self.set_state(SessionState::Punching);

        let sent = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut keepalive = spawn_keepalive(
            Arc::clone(&self.socket),
            hello,
            self.keepalive_interval,
            stop_rx,
            Arc::clone(&sent),
            Arc::clone(&self.metrics),
        );
        let mut keepalive_finished = false;

        tokio::pin!(shutdown);
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        let mut result = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break Ok(()),

                joined = &mut keepalive, if !keepalive_finished => {
                    keepalive_finished = true;
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(SessionError::Send(e)),
                        Err(e) => Err(SessionError::KeepaliveJoin(e.to_string())),
                    };
                }

                received = self.socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        if let Err(e) = self.handle_datagram(&buf[..len]).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(SessionError::Receive(e)),
                },
            }
        };

        // Stop and join the sender before the socket is released.
        let _ = stop_tx.send(true);
        if !keepalive_finished {
            match keepalive.await {
                Ok(Ok(())) => {}
                // The session is already over; a late send failure changes nothing.
                Ok(Err(e)) => {
                    debug!("Keepalive to {} failed while stopping: {}", self.peer_addr, e)
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(SessionError::KeepaliveJoin(e.to_string()));
                    }
                }
            }
        }

        self.metrics.session_ended(result.is_err());
        let sent = sent.load(Ordering::Relaxed);
        self.finish(result, sent)
    }

    fn finish(self, result: Result<(), SessionError>, keepalives_sent: u64) -> SessionReport {
        let state = match &result {
            Ok(()) => SessionState::Closed(CloseReason::Shutdown),
            Err(e) => {
                error!("Session with {} ended: {}", self.peer_id, e);
                SessionState::Closed(CloseReason::Failed(e.kind()))
            }
        };
        self.set_state(state);

        SessionReport {
            peer_id: self.peer_id,
            peer_addr: self.peer_addr,
            state,
            established: self.established,
            keepalives_sent,
            datagrams_received: self.datagrams_received,
            result,
        }
    }

    async fn handle_datagram(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        self.datagrams_received += 1;
        self.metrics.inc_datagrams_received();

        match PunchMessage::decode(buf) {
            PunchMessage::Hello(hello) => {
                info!(
                    "Received HELLO from {} ({}) via {}",
                    hello.sender_id, hello.sender_addr, self.peer_addr
                );
                let ack = PunchMessage::Ack(Ack {
                    nonce: hello.nonce,
                    observed_addr: self.peer_addr.to_string(),
                })
                .encode()
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
                self.socket.send(&ack).await.map_err(SessionError::Send)?;
            }
            PunchMessage::Ack(ack) if ack.nonce == self.nonce => {
                if !self.established {
                    self.established = true;
                    self.metrics.inc_sessions_established();
                    info!(
                        "Tunnel to {} established (peer sees us as {})",
                        self.peer_addr, ack.observed_addr
                    );
                    self.set_state(SessionState::Established);
                }
            }
            PunchMessage::Ack(_) => {
                debug!("Ignoring ACK with foreign nonce from {}", self.peer_addr);
            }
            PunchMessage::Raw(bytes) => {
                info!(
                    "Received from {}: {}",
                    self.peer_addr,
                    String::from_utf8_lossy(&bytes)
                );
            }
        }
        Ok(())
    }
}

/// Send `payload` every `interval` (first one immediately) until `stop` flips.
fn spawn_keepalive(
    socket: Arc<UdpSocket>,
    payload: Vec<u8>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    sent: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    // A dropped sender also means the session is gone.
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = socket.send(&payload).await {
                        warn!("Failed to send keepalive: {}", e);
                        return Err(e);
                    }
                    sent.fetch_add(1, Ordering::Relaxed);
                    metrics.inc_keepalives_sent();
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::oneshot;

    /// A UDP port that was free a moment ago.
    pub(crate) fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    fn endpoint(id: &str, port: u16) -> LocalEndpoint {
        LocalEndpoint {
            id: id.to_string(),
            port,
            advertised: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[tokio::test]
    async fn test_keepalive_cadence_and_stop() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let interval = Duration::from_millis(100);
        let metrics = Metrics::new();

        let session = PunchSession::open(
            endpoint("alice", free_udp_port()),
            "peer",
            peer_addr,
            interval,
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = tokio::spawn(session.run(async {
            let _ = stop_rx.await;
        }));

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut arrivals = Vec::new();
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(550) {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(50), peer.recv(&mut buf)).await
            {
                match PunchMessage::decode(&buf[..n]) {
                    PunchMessage::Hello(hello) => {
                        assert_eq!(hello.sender_id, "alice");
                        arrivals.push(Instant::now());
                    }
                    other => panic!("unexpected datagram {:?}", other),
                }
            }
        }
        assert!(
            (4..=8).contains(&arrivals.len()),
            "expected roughly one HELLO per 100ms, got {}",
            arrivals.len()
        );

        stop_tx.send(()).unwrap();
        let report = runner.await.unwrap();
        assert!(report.result.is_ok());
        assert_eq!(report.state, SessionState::Closed(CloseReason::Shutdown));
        assert!(!report.established);
        assert!(report.keepalives_sent >= arrivals.len() as u64);

        // Drain what was in flight, then nothing more may arrive.
        while peer.try_recv(&mut buf).is_ok() {}
        let late = tokio::time::timeout(interval * 3, peer.recv(&mut buf)).await;
        assert!(late.is_err(), "keepalive kept sending after the session ended");

        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_two_sessions_establish() {
        let port_a = free_udp_port();
        let port_b = free_udp_port();
        let addr_a = SocketAddr::from(([127, 0, 0, 1], port_a));
        let addr_b = SocketAddr::from(([127, 0, 0, 1], port_b));
        let metrics = Metrics::new();
        let interval = Duration::from_millis(50);

        // Both sockets must exist before either side sends.
        let alice = PunchSession::open(
            endpoint("alice", port_a),
            "bob",
            addr_b,
            interval,
            Arc::clone(&metrics),
        )
        .await
        .unwrap();
        let bob = PunchSession::open(
            endpoint("bob", port_b),
            "alice",
            addr_a,
            interval,
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let mut alice_state = alice.subscribe();
        let mut bob_state = bob.subscribe();

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_a = {
            let mut rx = stop_rx.clone();
            async move {
                let _ = rx.wait_for(|stop| *stop).await;
            }
        };
        let stop_b = {
            let mut rx = stop_rx;
            async move {
                let _ = rx.wait_for(|stop| *stop).await;
            }
        };

        let a = tokio::spawn(alice.run(stop_a));
        let b = tokio::spawn(bob.run(stop_b));

        tokio::time::timeout(Duration::from_secs(5), async {
            alice_state
                .wait_for(|s| *s == SessionState::Established)
                .await
                .unwrap();
            bob_state
                .wait_for(|s| *s == SessionState::Established)
                .await
                .unwrap();
        })
        .await
        .expect("sessions did not establish");

        stop_tx.send(true).unwrap();
        let a = a.await.unwrap();
        let b = b.await.unwrap();

        assert!(a.established && b.established);
        assert!(a.result.is_ok() && b.result.is_ok());
        assert!(a.datagrams_received > 0 && b.datagrams_received > 0);
        assert_eq!(metrics.sessions_established_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_foreign_ack_does_not_establish() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = free_udp_port();
        let session = PunchSession::open(
            endpoint("alice", port),
            "peer",
            peer.local_addr().unwrap(),
            Duration::from_millis(50),
            Metrics::new(),
        )
        .await
        .unwrap();
        let session_addr = SocketAddr::from(([127, 0, 0, 1], port));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = tokio::spawn(session.run(async {
            let _ = stop_rx.await;
        }));

        // Wait for the first HELLO so we know the session is punching.
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let n = peer.recv(&mut buf).await.unwrap();
        assert!(matches!(PunchMessage::decode(&buf[..n]), PunchMessage::Hello(_)));

        let stale = PunchMessage::Ack(Ack {
            nonce: [0xAB; 12],
            observed_addr: session_addr.to_string(),
        })
        .encode()
        .unwrap();
        peer.send_to(&stale, session_addr).await.unwrap();
        peer.send_to(b"plain text", session_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(()).unwrap();
        let report = runner.await.unwrap();
        assert!(!report.established);
        assert_eq!(report.datagrams_received, 2);
    }

    #[tokio::test]
    async fn test_hello_is_acked() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = free_udp_port();
        let session = PunchSession::open(
            endpoint("alice", port),
            "peer",
            peer.local_addr().unwrap(),
            Duration::from_secs(10),
            Metrics::new(),
        )
        .await
        .unwrap();
        let session_addr = SocketAddr::from(([127, 0, 0, 1], port));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = tokio::spawn(session.run(async {
            let _ = stop_rx.await;
        }));

        let hello = PunchMessage::Hello(Hello {
            sender_id: "peer".into(),
            sender_addr: peer.local_addr().unwrap().to_string(),
            nonce: [9u8; 12],
        })
        .encode()
        .unwrap();
        peer.send_to(&hello, session_addr).await.unwrap();

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let ack = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let n = peer.recv(&mut buf).await.unwrap();
                if let PunchMessage::Ack(ack) = PunchMessage::decode(&buf[..n]) {
                    return ack;
                }
            }
        })
        .await
        .expect("no ACK received");
        assert_eq!(ack.nonce, [9u8; 12]);

        stop_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unreachable_peer_closes_with_socket_error() {
        // Nobody listens here, so loopback answers with port unreachable.
        let dead_peer = SocketAddr::from(([127, 0, 0, 1], free_udp_port()));
        let metrics = Metrics::new();
        let session = PunchSession::open(
            endpoint("alice", free_udp_port()),
            "ghost",
            dead_peer,
            Duration::from_millis(50),
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            session.run(std::future::pending::<()>()),
        )
        .await
        .expect("session should fail on its own");

        assert!(report.result.is_err());
        assert_eq!(
            report.state,
            SessionState::Closed(CloseReason::Failed(ErrorKind::Socket))
        );
        assert_eq!(metrics.sessions_failed_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_socket_error() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = PunchSession::open(
            endpoint("alice", port),
            "bob",
            SocketAddr::from(([127, 0, 0, 1], 9)),
            Duration::from_secs(1),
            Metrics::new(),
        )
        .await
        .err()
        .expect("port is already bound");
        assert!(matches!(err, SessionError::Bind { .. }));
        assert_eq!(err.kind(), ErrorKind::Socket);
    }
}
