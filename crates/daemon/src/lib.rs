//! # natpunch
//!
//! NAT rendezvous registry and UDP hole-punching agent.
//!
//! Two peers behind independent NATs register their public `ip:port` with a
//! shared registry, look each other up, and then send to each other directly
//! so that both NATs open a mapping for the other side.
//!
//! ## Key Components
//!
//! ### Registry (server side)
//! - [`PeerRegistry`] - in-memory `id → address` store
//! - [`RegistryService`] / [`serve_registry`] - HTTP front-end
//!
//! ### Agent (client side)
//! - [`AddressResolver`] - public IP via HTTP echo, STUN, or a fixed address
//! - [`RegistryClient`] - register / lookup / list over HTTP
//! - [`Agent`] - startup registration and per-peer lookup
//! - [`PunchSession`] - keepalive sender + receiver over one UDP socket
//! - [`driver`] - interactive prompt loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use natpunch::{Agent, Config, Metrics};
//!
//! let config = Config::load("config.toml")?;
//! let agent = Agent::start(&config, Metrics::new()).await?;
//! let report = agent.connect("bob", async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! println!("established: {}", report.established);
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod stun;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{AgentConfig, Config, RegistryConfig, ResolverConfig, ResolverKind, TimingConfig};

// ============================================================================
// Errors
// ============================================================================

pub use error::{ConfigError, ErrorKind, RegistryError, ResolveError, SessionError, StartupError};

// ============================================================================
// Registry
// ============================================================================

pub use http::{serve_metrics, serve_registry, RegistryService};
pub use registry::{AddressRecord, PeerRegistry};

// ============================================================================
// Agent
// ============================================================================

pub use agent::Agent;
pub use client::RegistryClient;
pub use resolver::AddressResolver;
pub use session::{CloseReason, LocalEndpoint, PunchSession, SessionReport, SessionState};

// ============================================================================
// Wire Format
// ============================================================================

pub use protocol::{Ack, Hello, PunchMessage};

// ============================================================================
// Metrics
// ============================================================================

pub use metrics::Metrics;
