//! Interactive loop: ask for a peer id, punch to it, repeat.
//!
//! Attempts are strictly sequential and independent. A failed attempt is
//! reported and forgotten; nothing is retried or backed off.

use anyhow::Result;
use log::warn;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::agent::Agent;

const PROMPT: &str = "input peer id: ";
/// Typed at the prompt to print the registry instead of punching
pub const LIST_COMMAND: &str = ":peers";

/// Tally of what the driver did before its input ran out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub attempts: u64,
    pub established: u64,
    pub failed: u64,
}

/// Run attempts until `input` reaches EOF or shutdown is requested at the prompt.
///
/// `shutdown` builds a fresh future per prompt and per attempt. Resolving
/// while punching closes the current session and the prompt comes back;
/// resolving at the prompt ends the loop.
pub async fn run<R, W, S, F>(
    agent: &Agent,
    input: R,
    mut output: W,
    mut shutdown: S,
) -> Result<DriverStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut stats = DriverStats::default();

    loop {
        let peer_id = match read_peer_id(&mut lines, &mut output, shutdown()).await? {
            Some(id) => id,
            None => break,
        };

        if peer_id == LIST_COMMAND {
            print_peers(agent, &mut output).await?;
            continue;
        }

        stats.attempts += 1;
        let session = match agent.open_session(&peer_id).await {
            Ok(session) => session,
            Err(e) => {
                stats.failed += 1;
                output
                    .write_all(format!("get peer failed: {}\n", e).as_bytes())
                    .await?;
                continue;
            }
        };

        output
            .write_all(
                format!(
                    "punching {} at {} (Ctrl-C to stop)\n",
                    peer_id,
                    session.peer_addr()
                )
                .as_bytes(),
            )
            .await?;
        output.flush().await?;

        let report = session.run(shutdown()).await;
        if report.established {
            stats.established += 1;
        }

        let line = match &report.result {
            Ok(()) => format!(
                "session with {} closed ({}, {} sent, {} received)\n",
                report.peer_id,
                if report.established {
                    "established"
                } else {
                    "never established"
                },
                report.keepalives_sent,
                report.datagrams_received
            ),
            Err(e) => {
                stats.failed += 1;
                format!("session with {} failed: {}\n", report.peer_id, e)
            }
        };
        output.write_all(line.as_bytes()).await?;
    }

    Ok(stats)
}

/// Prompt until a non-blank line arrives. `None` on EOF or when `shutdown`
/// resolves while waiting for input.
async fn read_peer_id<R, W, F>(
    lines: &mut tokio::io::Lines<R>,
    output: &mut W,
    shutdown: F,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let line = tokio::select! {
            biased;
            line = lines.next_line() => line?,
            _ = &mut shutdown => return Ok(None),
        };

        match line {
            Some(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
            None => return Ok(None),
        }
    }
}

async fn print_peers<W>(agent: &Agent, output: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match agent.peers().await {
        Ok(mut peers) => {
            peers.sort_by(|a, b| a.id.cmp(&b.id));
            let mut listing = String::new();
            for peer in &peers {
                let marker = if peer.id == agent.id() { " (me)" } else { "" };
                listing.push_str(&format!("  {} -> {}{}\n", peer.id, peer.address, marker));
            }
            if peers.is_empty() {
                listing.push_str("  (no peers registered)\n");
            }
            output.write_all(listing.as_bytes()).await?;
        }
        Err(e) => {
            warn!("Listing peers failed: {}", e);
            output
                .write_all(format!("list peers failed: {}\n", e).as_bytes())
                .await?;
        }
    }
    Ok(())
}
