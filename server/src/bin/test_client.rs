//! Headless bot: joins a running server over UDP, walks forward and logs what
//! the server sends back.

use clap::Parser;
use log::{debug, error, info, warn};
use shared::protocol::{InputFrame, Message};
use shared::transport::{ClientTransport, NetClient};
use shared::{DEFAULT_PORT, PROTOCOL_VERSION};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,
    /// Seconds to walk before disconnecting
    #[clap(short, long, default_value = "10")]
    duration: u64,
    /// Player name sent in the hello
    #[clap(short, long, default_value = "test_client")]
    name: String,
    /// Inputs sent per second
    #[clap(short, long, default_value = "30")]
    rate: u32,
}

fn resolve(server: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    server
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("no address for {}", server).into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let server = resolve(&args.server)?;
    let mut client = match NetClient::connect(server, Duration::from_secs(5)) {
        Ok(client) => client,
        Err(e) => {
            error!("Could not connect to {}: {}", server, e);
            std::process::exit(1);
        }
    };

    client.send(&Message::ClientHello {
        version: PROTOCOL_VERSION,
        name: args.name.clone(),
    });
    client.send(&Message::JoinMatch);

    let input_interval = Duration::from_secs_f64(1.0 / args.rate.max(1) as f64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut next_input = Instant::now();
    let mut last_report = Instant::now();
    let mut seq = 0u32;
    let mut joined = false;
    let mut snapshots = 0u64;

    while Instant::now() < deadline && client.is_connected() {
        client.poll(Duration::from_millis(5));

        while let Some(message) = client.try_recv() {
            match message {
                Message::ServerHello {
                    version,
                    tick_rate,
                    world_seed,
                } => info!(
                    "Server protocol {}, {} Hz, seed {}",
                    version, tick_rate, world_seed
                ),
                Message::JoinAck { player_id, spawn } => {
                    info!(
                        "Joined as player {} at ({:.1}, {:.1}, {:.1})",
                        player_id, spawn.x, spawn.y, spawn.z
                    );
                    joined = true;
                }
                Message::StateSnapshot {
                    server_tick,
                    position,
                    on_ground,
                    last_input_seq,
                    ..
                } => {
                    snapshots += 1;
                    debug!(
                        "tick {} pos ({:.2}, {:.2}, {:.2}) ground={} acked input {}",
                        server_tick, position.x, position.y, position.z, on_ground, last_input_seq
                    );
                }
                Message::ActionRejected { seq, reason } => {
                    warn!("Request {} rejected: {:?}", seq, reason)
                }
                Message::ChatMessage { text } => info!("[chat] {}", text),
                other => debug!("Received {}", other.kind()),
            }
        }

        let now = Instant::now();
        if joined && now >= next_input {
            next_input += input_interval;
            seq += 1;
            client.send(&Message::InputFrame(InputFrame {
                seq,
                move_y: 1.0,
                ..InputFrame::default()
            }));
        }

        if now.duration_since(last_report) >= Duration::from_secs(1) {
            last_report = now;
            if let Some(stats) = client.stats() {
                info!(
                    "{} snapshots, {} inputs, rtt {:.1} ms, loss {:.1}%",
                    snapshots,
                    seq,
                    stats.rtt_ms,
                    stats.packet_loss * 100.0
                );
            }
        }
    }

    if !client.is_connected() {
        warn!("Server closed the connection");
    }
    client.disconnect();
    info!("Test client finished after {} snapshots", snapshots);
    Ok(())
}
