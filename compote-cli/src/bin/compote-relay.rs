//! Host port relay.
//!
//! A long-lived child process bridging one host socket into a container
//! address: `compote-relay <tcp|udp> <listen> <target>`. TCP spawns a
//! bidirectional relay per accepted connection; UDP serves every client from
//! a single socket, remembering the most recent peer for return traffic.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, warn};

#[derive(Parser)]
#[command(name = "compote-relay")]
#[command(about = "Forward one host port into a container", version)]
struct Args {
    /// Protocol: tcp or udp
    proto: String,

    /// Host address to listen on (ip:port)
    listen: SocketAddr,

    /// Container address to forward to (ip:port)
    target: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.proto.as_str() {
        "tcp" => run_tcp(args.listen, args.target).await,
        "udp" => run_udp(args.listen, args.target).await,
        other => bail!("unsupported protocol '{other}' (expected tcp or udp)"),
    }
}

async fn run_tcp(listen: SocketAddr, target: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    debug!(%listen, %target, "TCP relay listening");

    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                debug!(%peer, "Accepted connection");
                tokio::spawn(async move {
                    match TcpStream::connect(target).await {
                        Ok(upstream) => relay_tcp(client, upstream).await,
                        Err(e) => warn!(%target, error = %e, "Failed to reach container"),
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                return Err(e.into());
            }
        }
    }
}

/// Copy both directions until either side closes.
async fn relay_tcp(mut client: TcpStream, mut upstream: TcpStream) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let to_container = async {
        let mut buf = vec![0u8; 8192];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if upstream_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    let to_client = async {
        let mut buf = vec![0u8; 8192];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    tokio::select! {
        _ = to_container => {},
        _ = to_client => {},
    }

    debug!("Connection closed");
}

async fn run_udp(listen: SocketAddr, target: SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    debug!(%listen, %target, "UDP relay listening");

    let mut buf = vec![0u8; 65536];
    let mut last_client: Option<SocketAddr> = None;

    loop {
        let (n, from) = socket.recv_from(&mut buf).await.context("recv failed")?;

        if from == target {
            // Return traffic goes to whichever client spoke last.
            if let Some(client) = last_client {
                if let Err(e) = socket.send_to(&buf[..n], client).await {
                    warn!(%client, error = %e, "Failed to relay reply");
                }
            }
        } else {
            last_client = Some(from);
            if let Err(e) = socket.send_to(&buf[..n], target).await {
                warn!(%target, error = %e, "Failed to relay datagram");
            }
        }
    }
}
