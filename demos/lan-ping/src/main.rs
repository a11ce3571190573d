//! Tether LAN ping demo
//!
//! A host runs a game server and answers discovery searches. A searcher
//! finds it, connects, and measures round trips with reliable pings.
//!
//! Environment variables:
//! - LAN_PING_MODE: "host", "search" or "both" (default, one process on loopback)
//! - LAN_PING_GAME: game name to announce and search for (default "lan-ping")
//! - LAN_PING_BROADCAST: search target (default 255.255.255.255:4450, loopback in "both")
//! - RUST_LOG: tracing filter (default "info")

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tether_net::TetherError;
use tether_net::client::{Client, ClientBuilder};
use tether_net::connection::ConnectionEvent;
use tether_net::core::constants::DEFAULT_SERVER_PORT;
use tether_net::discovery::{
    DiscoveryEvent, DiscoveryHost, DiscoveryHostConfig, DiscoverySearcher, DiscoverySearcherConfig,
};
use tether_net::segment::{BinaryDecoder, BinaryEncoder, SegmentType};
use tether_net::server::{Server, ServerBuilder, ServerEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PING: SegmentType = SegmentType(1);
const PONG: SegmentType = SegmentType(2);
const FRAME: Duration = Duration::from_millis(16);
const PINGS: u32 = 20;

fn game_name() -> String {
    env::var("LAN_PING_GAME").unwrap_or_else(|_| "lan-ping".to_owned())
}

fn broadcast_addr(default: SocketAddr) -> Result<SocketAddr, TetherError> {
    match env::var("LAN_PING_BROADCAST") {
        Ok(value) => value
            .parse()
            .map_err(|e| TetherError::Config(format!("LAN_PING_BROADCAST: {e}"))),
        Err(_) => Ok(default),
    }
}

async fn run_host() -> Result<(), TetherError> {
    let mut server = Server::bind(ServerBuilder::new().max_clients(4).build()).await?;
    let host = DiscoveryHost::bind(
        DiscoveryHostConfig::new(game_name(), DEFAULT_SERVER_PORT).with_server_name("lan-ping host"),
    )
    .await?;
    let players = Arc::new(AtomicU8::new(0));
    let counter = players.clone();
    host.set_reply_hook(move |encoder| {
        encoder.write_u8(counter.load(Ordering::Relaxed));
    });

    let mut frame = tokio::time::interval(FRAME);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = frame.tick() => {}
        }
        server.tick(FRAME);
        while let Some(event) = server.poll_event() {
            match event {
                ServerEvent::ClientConnected(client) => {
                    info!(%client, "player joined");
                    players.store(server.client_count() as u8, Ordering::Relaxed);
                }
                ServerEvent::ClientDisconnected { client, reason } => {
                    info!(%client, %reason, "player left");
                    players.store(server.client_count() as u8, Ordering::Relaxed);
                }
                ServerEvent::Received { client, segment } if segment.segment_type() == PING => {
                    let Ok(sequence) = BinaryDecoder::new(&segment).read_u32() else {
                        continue;
                    };
                    if let Some(mut pong) = server.request_segment(client, PONG) {
                        BinaryEncoder::new(&mut pong).write_u32(sequence);
                        server.send_reliable(client, pong, None)?;
                    }
                }
                _ => {}
            }
        }
    }

    host.release().await;
    server.release().await;
    Ok(())
}

async fn run_search(broadcast: SocketAddr) -> Result<(), TetherError> {
    let mut searcher = DiscoverySearcher::bind(
        DiscoverySearcherConfig::new(game_name()).with_broadcast_addr(broadcast),
    )
    .await?;
    info!(%broadcast, "searching");
    let server = loop {
        match searcher.next_event().await {
            Some(DiscoveryEvent::ServerFound(server)) => break server,
            Some(_) => {}
            None => return Err(TetherError::Config("searcher stopped".into())),
        }
    };
    let players = server.extra_decoder().read_u8().unwrap_or(0);
    info!(server = %server.server_name, address = %server.address, players, "found server");
    searcher.release().await;

    let mut client = Client::connect(ClientBuilder::new().server_addr(server.address).build()).await?;
    let mut frame = tokio::time::interval(FRAME);
    let mut sent = 0u32;
    let mut answered = 0u32;
    while answered < PINGS {
        frame.tick().await;
        client.tick(FRAME);
        while let Some(event) = client.poll_event() {
            match event {
                ConnectionEvent::Connected => info!("connected"),
                ConnectionEvent::Received(segment) if segment.segment_type() == PONG => {
                    answered += 1;
                    info!(
                        sequence = BinaryDecoder::new(&segment).read_u32().unwrap_or(0),
                        ping_ms = client.statistics().ping_ms(),
                        "pong"
                    );
                }
                ConnectionEvent::Disconnected(reason) => {
                    warn!(%reason, "disconnected");
                    return Ok(());
                }
                _ => {}
            }
        }
        if client.is_connected() && sent == answered && sent < PINGS {
            if let Some(mut ping) = client.request_segment(PING) {
                sent += 1;
                BinaryEncoder::new(&mut ping).write_u32(sent);
                client.send_reliable(ping, None)?;
            }
        }
    }

    let statistics = client.statistics();
    info!(
        packets_sent = statistics.packets_sent(),
        packets_received = statistics.packets_received(),
        segments_resent = statistics.segments_resent(),
        ping_ms = statistics.ping_ms(),
        "done"
    );
    client.release().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), TetherError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode = env::var("LAN_PING_MODE").unwrap_or_else(|_| "both".to_owned());
    match mode.as_str() {
        "host" => run_host().await,
        "search" => run_search(broadcast_addr(SocketAddr::from(([255, 255, 255, 255], 4450)))?).await,
        "both" => {
            let host = tokio::spawn(run_host());
            // Give the host time to bind before the first search.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let result = run_search(broadcast_addr(SocketAddr::from(([127, 0, 0, 1], 4450)))?).await;
            host.abort();
            result
        }
        other => Err(TetherError::Config(format!(
            "LAN_PING_MODE must be host, search or both, got {other}"
        ))),
    }
}
