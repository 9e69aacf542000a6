//! Public IP discovery.
//!
//! The agent advertises `<public ip>:<local port>` to the registry. The public
//! IP comes from one of three sources:
//! - an HTTP echo service answering `{"ip": "..."}` (default)
//! - STUN binding requests
//! - a fixed, configured address
//!
//! Resolution never retries on its own; callers decide what a failure means.

use log::{debug, info};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use crate::config::{ResolverConfig, ResolverKind};
use crate::error::ResolveError;
use crate::stun::{build_binding_request, parse_binding_response, STUN_SERVERS};

#[derive(Debug, Deserialize)]
struct EchoResponse {
    #[serde(default)]
    ip: Option<String>,
}

/// Where the agent's public IP comes from.
#[derive(Debug, Clone)]
pub enum AddressResolver {
    Http { url: String, client: reqwest::Client },
    Stun { servers: Vec<String>, timeout: Duration },
    Static(IpAddr),
}

impl AddressResolver {
    pub fn from_config(config: &ResolverConfig) -> Result<Self, ResolveError> {
        match config.kind {
            ResolverKind::Http => Self::http(&config.echo_url, config.timeout()),
            ResolverKind::Stun => {
                let servers = if config.stun_servers.is_empty() {
                    STUN_SERVERS.iter().map(|s| s.to_string()).collect()
                } else {
                    config.stun_servers.clone()
                };
                Ok(AddressResolver::Stun {
                    servers,
                    timeout: config.timeout(),
                })
            }
            ResolverKind::Static => config
                .public_ip
                .map(AddressResolver::Static)
                .ok_or(ResolveError::Empty),
        }
    }

    pub fn http(url: &str, request_timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(AddressResolver::Http {
            url: url.to_string(),
            client,
        })
    }

    /// Ask the configured source for our public IPv4 address.
    pub async fn resolve_external_address(&self) -> Result<IpAddr, ResolveError> {
        let ip = match self {
            AddressResolver::Http { url, client } => resolve_http(client, url).await?,
            AddressResolver::Stun { servers, timeout } => resolve_stun(servers, *timeout).await?,
            AddressResolver::Static(ip) => *ip,
        };

        if ip.is_ipv6() {
            return Err(ResolveError::Unsupported(ip.to_string()));
        }

        info!("External IP: {}", ip);
        Ok(ip)
    }
}

async fn resolve_http(client: &reqwest::Client, url: &str) -> Result<IpAddr, ResolveError> {
    debug!("Querying address echo service {}", url);
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ResolveError::Status(response.status().as_u16()));
    }
    let body = response.text().await?;
    parse_echo_body(&body)
}

/// Parse `{"ip": "..."}`; an empty or missing field is a failure.
pub fn parse_echo_body(body: &str) -> Result<IpAddr, ResolveError> {
    let parsed: EchoResponse =
        serde_json::from_str(body).map_err(|e| ResolveError::Parse(e.to_string()))?;

    let ip = parsed.ip.unwrap_or_default();
    let ip = ip.trim();
    if ip.is_empty() {
        return Err(ResolveError::Empty);
    }
    ip.parse()
        .map_err(|_| ResolveError::InvalidIp(ip.to_string()))
}

async fn resolve_stun(
    servers: &[String],
    query_timeout: Duration,
) -> Result<IpAddr, ResolveError> {
    if servers.is_empty() {
        return Err(ResolveError::Stun("no STUN servers configured".into()));
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ResolveError::Stun(format!("bind failed: {}", e)))?;

    let mut last_error = String::new();
    for server in servers {
        match query_stun_server(&socket, server, query_timeout).await {
            Ok(mapped) => {
                debug!("STUN server {} mapped us to {}", server, mapped);
                return Ok(mapped.ip());
            }
            Err(e) => {
                debug!("STUN query to {} failed: {}", server, e);
                last_error = format!("{}: {}", server, e);
            }
        }
    }

    Err(ResolveError::Stun(last_error))
}

async fn query_stun_server(
    socket: &UdpSocket,
    server: &str,
    query_timeout: Duration,
) -> Result<SocketAddr, String> {
    let server_addr = timeout(query_timeout, lookup_host(server))
        .await
        .map_err(|_| "DNS timeout".to_string())?
        .map_err(|e| format!("DNS failed: {}", e))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| "no IPv4 address".to_string())?;

    let tx_id: [u8; 12] = rand::random();
    socket
        .send_to(&build_binding_request(&tx_id), server_addr)
        .await
        .map_err(|e| format!("send failed: {}", e))?;

    let mut buf = [0u8; 1024];
    loop {
        let (n, src) = timeout(query_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| "timeout".to_string())?
            .map_err(|e| format!("recv failed: {}", e))?;

        // Late answers from a previous server are skipped.
        if src != server_addr {
            continue;
        }
        return parse_binding_response(&buf[..n], &tx_id)
            .ok_or_else(|| "no mapped address in response".to_string());
    }
}
