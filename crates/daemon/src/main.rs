use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info};
use natpunch::{
    config::{Config, ResolverKind},
    driver,
    http::{self, RegistryService},
    Agent, Metrics, PeerRegistry,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Rendezvous server holding peer addresses
    Registry,
    /// Interactive hole-punching client
    Agent,
}

#[derive(Parser, Debug)]
#[command(
    name = "natpunch",
    version,
    about = "NAT rendezvous registry and UDP hole-punching agent",
    long_about = "natpunch\n\n\
        Two peers behind NAT register their public address with a registry,\n\
        look each other up, and punch a direct UDP path.\n\n\
        Examples:\n  \
          # Run the registry\n  \
          natpunch --mode registry --port 21200\n\n  \
          # Run an agent\n  \
          natpunch --server http://1.2.3.4:21200 --id alice --local-port 40000"
)]
struct Args {
    /// Run mode
    #[arg(short, long, value_enum, default_value_t = Mode::Agent)]
    mode: Mode,

    /// Path to config file (TOML, or the flat JSON client format)
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,

    /// Registry HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Registry base URL, e.g. http://1.2.3.4:21200
    #[arg(long)]
    server: Option<String>,

    /// Identifier to register under
    #[arg(long)]
    id: Option<String>,

    /// Local UDP port to bind and advertise
    #[arg(long)]
    local_port: Option<u16>,

    /// Skip discovery and advertise this public IP
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Serve agent metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    if let Some(port) = args.port {
        config.registry.port = port;
    }
    if let Some(server) = &args.server {
        config.agent.server = server.clone();
    }
    if let Some(id) = &args.id {
        config.agent.local_id = id.clone();
    }
    if let Some(port) = args.local_port {
        config.agent.local_port = port;
    }
    if let Some(ip) = args.public_ip {
        config.resolver.kind = ResolverKind::Static;
        config.resolver.public_ip = Some(ip);
    }
    if args.metrics_port.is_some() {
        config.agent.metrics_port = args.metrics_port;
    }

    Ok(config)
}

async fn run_registry(config: &Config) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.registry.port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind registry on {}", addr))?;

    let service = RegistryService::new(Arc::new(PeerRegistry::new()), Metrics::new());

    tokio::select! {
        result = http::serve_registry(listener, service) => result,
        _ = signal::ctrl_c() => {
            info!("Exiting...");
            Ok(())
        }
    }
}

async fn run_agent(config: &Config) -> Result<()> {
    let metrics = Metrics::new();

    if let Some(port) = config.agent.metrics_port {
        let metrics_clone = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(metrics_clone, port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let agent = Agent::start(config, metrics)
        .await
        .context("agent startup failed")?;
    println!(
        "server: {}\nlocal port: {}\nlocal id: {}\nadvertised: {}",
        config.agent.server,
        agent.advertised_addr().port(),
        agent.id(),
        agent.advertised_addr()
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stats = driver::run(&agent, stdin, tokio::io::stdout(), || async {
        let _ = signal::ctrl_c().await;
    })
    .await?;

    info!(
        "Input closed after {} attempts ({} established, {} failed)",
        stats.attempts, stats.established, stats.failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let default_level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match args.mode {
        Mode::Registry => {
            info!("Starting registry on port {}...", config.registry.port);
            run_registry(&config).await
        }
        Mode::Agent => run_agent(&config).await,
    }
}
