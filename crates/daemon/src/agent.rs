//! Punching agent: registers our public endpoint once at startup and opens a
//! [`PunchSession`] per peer the operator asks for.

use log::{info, warn};
use std::future::Future;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::client::RegistryClient;
use crate::config::Config;
use crate::error::{RegistryError, SessionError, StartupError};
use crate::metrics::Metrics;
use crate::registry::AddressRecord;
use crate::resolver::AddressResolver;
use crate::session::{CloseReason, LocalEndpoint, PunchSession, SessionReport, SessionState};
use tokio::sync::watch;

pub struct Agent {
    local: LocalEndpoint,
    client: RegistryClient,
    keepalive_interval: Duration,
    metrics: Arc<Metrics>,
    state: watch::Sender<SessionState>,
}

impl Agent {
    /// Resolve our public IP, check the local port, and register with the
    /// registry. Any failure here means peers cannot find us, so it is fatal.
    pub async fn start(config: &Config, metrics: Arc<Metrics>) -> Result<Self, StartupError> {
        let (state, _) = watch::channel(SessionState::Idle);
        Self::start_with_state(config, metrics, state).await
    }

    /// Like [`Agent::start`], publishing `Idle`, `Registering` and then
    /// `AwaitingPeer` (or `Closed` on failure) on `state`.
    pub async fn start_with_state(
        config: &Config,
        metrics: Arc<Metrics>,
        state: watch::Sender<SessionState>,
    ) -> Result<Self, StartupError> {
        state.send_replace(SessionState::Idle);

        match bring_up(config, &state).await {
            Ok((local, client)) => {
                state.send_replace(SessionState::AwaitingPeer);
                Ok(Self {
                    local,
                    client,
                    keepalive_interval: config.timing.keepalive_interval(),
                    metrics,
                    state,
                })
            }
            Err(e) => {
                state.send_replace(SessionState::Closed(CloseReason::Failed(e.kind())));
                Err(e)
            }
        }
    }

    /// Agent-level state; stays `AwaitingPeer` once registration succeeded.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.local.id
    }

    /// The address the registry holds for us.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.local.advertised
    }

    /// Look up `peer_id` and bind a socket towards it.
    pub async fn open_session(&self, peer_id: &str) -> Result<PunchSession, SessionError> {
        let opened = self.lookup_and_bind(peer_id).await;
        if let Err(e) = &opened {
            warn!("Cannot punch to '{}': {}", peer_id, e);
            self.metrics.inc_sessions_failed();
        }
        opened
    }

    async fn lookup_and_bind(&self, peer_id: &str) -> Result<PunchSession, SessionError> {
        let address = self.client.lookup(peer_id).await?;
        let peer_addr: SocketAddr = address
            .parse()
            .map_err(|_| RegistryError::InvalidAddress(address.clone()))?;
        info!("Peer '{}' is at {}", peer_id, peer_addr);

        PunchSession::open(
            self.local.clone(),
            peer_id,
            peer_addr,
            self.keepalive_interval,
            Arc::clone(&self.metrics),
        )
        .await
    }

    /// One full attempt: lookup, then punch until `shutdown` or a socket error.
    pub async fn connect<F>(
        &self,
        peer_id: &str,
        shutdown: F,
    ) -> Result<SessionReport, SessionError>
    where
        F: Future<Output = ()>,
    {
        let session = self.open_session(peer_id).await?;
        Ok(session.run(shutdown).await)
    }

    pub async fn peers(&self) -> Result<Vec<AddressRecord>, RegistryError> {
        self.client.list().await
    }
}

async fn bring_up(
    config: &Config,
    state: &watch::Sender<SessionState>,
) -> Result<(LocalEndpoint, RegistryClient), StartupError> {
    config.validate_agent()?;
    let resolver = AddressResolver::from_config(&config.resolver)?;
    let client = RegistryClient::new(&config.agent.server, config.timing.request_timeout())?;
    let port = probe_local_port(config.agent.local_port)?;

    state.send_replace(SessionState::Registering);
    let ip = resolver.resolve_external_address().await?;
    let advertised = SocketAddr::new(ip, port);

    client
        .register(&config.agent.local_id, &advertised.to_string())
        .await?;
    info!(
        "Registered as '{}' at {} with {}",
        config.agent.local_id,
        advertised,
        client.base_url()
    );

    let local = LocalEndpoint {
        id: config.agent.local_id.clone(),
        port,
        advertised,
    };
    Ok((local, client))
}

/// Bind the UDP port once so a conflict surfaces at startup. Port 0 resolves
/// to whatever the OS hands out, which is then reused by every session.
fn probe_local_port(port: u16) -> Result<u16, StartupError> {
    let socket = StdUdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .map_err(|source| StartupError::Bind { port, source })?;
    let bound = socket
        .local_addr()
        .map_err(|source| StartupError::Bind { port, source })?;
    Ok(bound.port())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::tests::spawn_registry;
    use crate::config::ResolverKind;
    use crate::error::ErrorKind;
    use std::sync::atomic::Ordering;

    pub(crate) fn agent_config(server: &str, id: &str) -> Config {
        let mut config = Config::default();
        config.agent.server = server.to_string();
        config.agent.local_id = id.to_string();
        config.agent.local_port = 0;
        config.resolver.kind = ResolverKind::Static;
        config.resolver.public_ip = Some("127.0.0.1".parse().unwrap());
        config.timing.keepalive_interval_ms = 50;
        config.timing.request_timeout_secs = 5;
        config
    }

    #[tokio::test]
    async fn test_start_registers_advertised_address() {
        let (url, registry) = spawn_registry().await;
        let agent = Agent::start(&agent_config(&url, "alice"), Metrics::new())
            .await
            .unwrap();

        assert_eq!(agent.id(), "alice");
        assert_ne!(agent.advertised_addr().port(), 0);
        assert_eq!(
            registry.lookup("alice"),
            Some(agent.advertised_addr().to_string())
        );
    }

    #[tokio::test]
    async fn test_start_publishes_registration_states() {
        // Accepts connections but never answers, so registration hangs.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", silent.local_addr().unwrap());
        let mut config = agent_config(&url, "alice");
        config.timing.request_timeout_secs = 1;

        let (state, mut observed) = watch::channel(SessionState::Idle);
        let start = tokio::spawn(async move {
            Agent::start_with_state(&config, Metrics::new(), state).await.err()
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            observed.wait_for(|s| *s == SessionState::Registering),
        )
        .await
        .unwrap()
        .unwrap();

        let err = start.await.unwrap().expect("registration should time out");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(
            *observed.borrow(),
            SessionState::Closed(CloseReason::Failed(ErrorKind::Transport))
        );
    }

    #[tokio::test]
    async fn test_started_agent_awaits_peer() {
        let (url, _registry) = spawn_registry().await;
        let agent = Agent::start(&agent_config(&url, "alice"), Metrics::new())
            .await
            .unwrap();
        assert_eq!(*agent.subscribe().borrow(), SessionState::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_start_fails_without_registry() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = agent_config(&format!("http://127.0.0.1:{}", port), "alice");

        let err = Agent::start(&config, Metrics::new()).await.err().unwrap();
        assert!(matches!(err, StartupError::Register(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let config = agent_config("", "alice");
        let err = Agent::start(&config, Metrics::new()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_start_fails_when_port_taken() {
        let (url, _registry) = spawn_registry().await;
        let taken = StdUdpSocket::bind("0.0.0.0:0").unwrap();
        let mut config = agent_config(&url, "alice");
        config.agent.local_port = taken.local_addr().unwrap().port();

        let err = Agent::start(&config, Metrics::new()).await.err().unwrap();
        assert!(matches!(err, StartupError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let (url, _registry) = spawn_registry().await;
        let metrics = Metrics::new();
        let agent = Agent::start(&agent_config(&url, "alice"), Arc::clone(&metrics))
            .await
            .unwrap();

        let err = agent
            .connect("bob", std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(metrics.sessions_failed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_invalid_registered_address() {
        let (url, registry) = spawn_registry().await;
        registry.register("mallory", "not-an-address");
        let agent = Agent::start(&agent_config(&url, "alice"), Metrics::new())
            .await
            .unwrap();

        let err = agent.open_session("mallory").await.err().unwrap();
        assert!(matches!(
            err,
            SessionError::Lookup(RegistryError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_two_agents_punch_through_registry() {
        let (url, _registry) = spawn_registry().await;
        let alice = Agent::start(&agent_config(&url, "alice"), Metrics::new())
            .await
            .unwrap();
        let bob = Agent::start(&agent_config(&url, "bob"), Metrics::new())
            .await
            .unwrap();

        let to_bob = alice.open_session("bob").await.unwrap();
        let to_alice = bob.open_session("alice").await.unwrap();
        assert_eq!(to_bob.peer_addr(), bob.advertised_addr());
        assert_eq!(to_alice.peer_addr(), alice.advertised_addr());

        let mut alice_state = to_bob.subscribe();
        let mut bob_state = to_alice.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopped = |mut rx: watch::Receiver<bool>| async move {
            let _ = rx.wait_for(|stop| *stop).await;
        };

        let a = tokio::spawn(to_bob.run(stopped(stop_rx.clone())));
        let b = tokio::spawn(to_alice.run(stopped(stop_rx)));

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
        .expect("agents did not establish a tunnel");

        stop_tx.send(true).unwrap();
        for report in [a.await.unwrap(), b.await.unwrap()] {
            assert!(report.established);
            assert_eq!(report.state, SessionState::Closed(CloseReason::Shutdown));
        }
    }
}
