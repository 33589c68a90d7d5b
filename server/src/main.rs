use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use log::{error, info, warn};
use server::{Server, ServerConfig};
use shared::transport::NetServerTransport;
use shared::{DEFAULT_MAX_PLAYERS, DEFAULT_PORT, DEFAULT_SEED, DEFAULT_TICK_RATE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Dedicated server for the voxel match.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// UDP port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Maximum number of connected players
    #[clap(short, long, default_value_t = DEFAULT_MAX_PLAYERS)]
    max_players: usize,
    /// Simulation ticks per second
    #[clap(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tickrate: u32,
    /// World seed for procedural terrain
    #[clap(short, long, default_value_t = DEFAULT_SEED)]
    seed: u64,
    /// Directory holding map templates; exports are written here too
    #[clap(long)]
    maps_dir: Option<PathBuf>,
    /// Log at debug level
    #[clap(short, long, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log warnings and errors
    #[clap(short, long)]
    quiet: bool,
}

const KNOWN_FLAGS: &[&str] = &[
    "--port",
    "--host",
    "--max-players",
    "--tickrate",
    "--seed",
    "--maps-dir",
    "--verbose",
    "--quiet",
    "--help",
    "--version",
];

/// Long flags that take no value.
const SWITCHES: &[&str] = &["--verbose", "--quiet", "--help", "--version"];

/// Letters of the short flags, including clap's `-h` and `-V`.
const KNOWN_SHORTS: &str = "pHmtsvqhV";

/// Drops unrecognised flags, together with a following value, so an
/// outdated launcher script cannot stop the server from starting. A value
/// given to a switch (`--verbose=true`) is dropped and the switch kept.
fn strip_unknown_flags(args: impl IntoIterator<Item = String>) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut args = args.into_iter().peekable();
    if let Some(program) = args.next() {
        kept.push(program);
    }

    while let Some(arg) = args.next() {
        if let Some(long) = arg.strip_prefix("--").filter(|rest| !rest.is_empty()) {
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (format!("--{}", name), Some(value)),
                None => (arg.clone(), None),
            };
            if SWITCHES.contains(&name.as_str()) && value.is_some() {
                dropped.push(arg.clone());
                kept.push(name);
            } else if KNOWN_FLAGS.contains(&name.as_str()) {
                kept.push(arg);
            } else if value.is_none() {
                match args.next_if(|next| !next.starts_with('-')) {
                    Some(value) => dropped.push(format!("{} {}", arg, value)),
                    None => dropped.push(arg),
                }
            } else {
                dropped.push(arg);
            }
        } else if let Some(short) = arg.strip_prefix('-').filter(|rest| !rest.is_empty()) {
            match short.chars().next() {
                Some(letter) if KNOWN_SHORTS.contains(letter) => kept.push(arg),
                _ => match args.next_if(|next| !next.starts_with('-')) {
                    Some(value) => dropped.push(format!("{} {}", arg, value)),
                    None => dropped.push(arg),
                },
            }
        } else {
            kept.push(arg);
        }
    }
    (kept, dropped)
}

/// Parses the command line. Arguments clap still refuses as unknown are
/// dropped one at a time; any other error (bad value, `--help`) ends the
/// process through clap.
fn parse_args(args: impl IntoIterator<Item = String>) -> (Args, Vec<String>) {
    let (mut argv, mut dropped) = strip_unknown_flags(args);
    loop {
        match Args::try_parse_from(&argv) {
            Ok(args) => return (args, dropped),
            Err(e) if e.kind() == ErrorKind::UnknownArgument => {
                let bad = match e.get(ContextKind::InvalidArg) {
                    Some(ContextValue::String(bad)) => bad.clone(),
                    _ => e.exit(),
                };
                match argv.iter().skip(1).position(|arg| *arg == bad) {
                    Some(index) => dropped.push(argv.remove(index + 1)),
                    None => e.exit(),
                }
            }
            Err(e) => e.exit(),
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Clears `running` on SIGINT or SIGTERM. The returned runtime must stay
/// alive for the listeners to work.
fn install_signal_handlers(
    running: Arc<AtomicBool>,
) -> Result<tokio::runtime::Runtime, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("signals")
        .enable_all()
        .build()?;

    runtime.spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received Ctrl+C, shutting down");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            }
        }
        running.store(false, Ordering::SeqCst);
    });

    Ok(runtime)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, dropped) = parse_args(std::env::args());
    init_logging(&args);
    for flag in dropped {
        warn!("Ignoring unknown option {}", flag);
    }

    let config = ServerConfig {
        tick_rate: args.tickrate.max(1),
        max_players: args.max_players.max(1),
        seed: args.seed,
        maps_dir: args.maps_dir.clone(),
    };

    let transport = match NetServerTransport::bind(&args.host, args.port, config.max_players) {
        Ok(transport) => transport,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting server: {} players max, {} Hz, seed {}",
        config.max_players, config.tick_rate, config.seed
    );
    let handle = Server::new(config, transport).spawn()?;
    let _signals = install_signal_handlers(handle.running_flag())?;

    while handle.is_running() {
        std::thread::sleep(Duration::from_millis(100));
    }

    if !handle.join() {
        error!("Server stopped after the tick thread panicked");
        std::process::exit(1);
    }
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_flags_are_stripped() {
        let (kept, dropped) = strip_unknown_flags(argv(&[
            "server", "--port", "9000", "--fps", "60", "--legacy", "--seed=4", "--gui=off",
        ]));
        assert_eq!(kept, argv(&["server", "--port", "9000", "--seed=4"]));
        assert_eq!(dropped, argv(&["--fps 60", "--legacy", "--gui=off"]));
    }

    #[test]
    fn test_unknown_short_flag_is_ignored() {
        let (args, dropped) = parse_args(argv(&["server", "-x", "--port", "9000"]));
        assert_eq!(args.port, 9000);
        assert_eq!(dropped, argv(&["-x"]));

        let (args, dropped) = parse_args(argv(&["server", "-z", "3", "-v", "-t", "60"]));
        assert!(args.verbose);
        assert_eq!(args.tickrate, 60);
        assert_eq!(dropped, argv(&["-z 3"]));
    }

    #[test]
    fn test_switch_with_value_keeps_switch() {
        let (args, dropped) = parse_args(argv(&["server", "--verbose=true", "--port=9001"]));
        assert!(args.verbose);
        assert_eq!(args.port, 9001);
        assert_eq!(dropped, argv(&["--verbose=true"]));
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["server"]);
        assert_eq!(args.port, 7777);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.max_players, 16);
        assert_eq!(args.tickrate, 30);
        assert_eq!(args.seed, 1337);
        assert!(args.maps_dir.is_none());
    }

    #[test]
    fn test_flags_parse() {
        let args = Args::parse_from([
            "server",
            "--port",
            "9000",
            "--tickrate",
            "60",
            "--maps-dir",
            "/tmp/maps",
            "--verbose",
        ]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.tickrate, 60);
        assert_eq!(args.maps_dir, Some(PathBuf::from("/tmp/maps")));
        assert!(args.verbose);
    }
}
