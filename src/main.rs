//! dnsferry - file transfer inside DNS query names
//!
//! `dnsferry send` pushes a file to a listener as a paced series of A queries;
//! `dnsferry serve` is that listener, writing reconstructed files to disk.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dnsferry::dns::{resolve_server, Listener, UdpQuerySender};
use dnsferry::json_logger::JsonLogger;
use dnsferry::session::{GapFill, KeyPolicy};
use dnsferry::{ChunkPlanner, FerryConfig, ReassemblyEngine, ReceiverConfig, Sender, SenderConfig};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "dnsferry")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "File transfer carried inside DNS query names", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file as a sequence of DNS queries
    Send {
        /// File to send
        file: PathBuf,

        /// Base domain the listener serves
        #[arg(short, long)]
        domain: Option<String>,

        /// Server IP, ip:port or hostname (resolved from the domain when omitted)
        #[arg(short, long)]
        server: Option<String>,

        /// Prefix tag prepended to the base domain
        #[arg(short, long)]
        prefix: Option<String>,

        /// Delay between queries (e.g. "100ms")
        #[arg(long, value_parser = humantime::parse_duration)]
        delay: Option<Duration>,

        /// Bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Resolver used to look up the server
        #[arg(long, value_name = "ADDR")]
        resolver: Option<SocketAddr>,
    },

    /// Print the query names a transfer would send, without sending
    Plan {
        /// File to plan
        file: PathBuf,

        /// Base domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Prefix tag prepended to the base domain
        #[arg(short, long)]
        prefix: Option<String>,

        /// Bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Listen for transfers and write received files
    Serve {
        /// Base domain to serve
        #[arg(short, long)]
        domain: Option<String>,

        /// Prefix tag prepended to the base domain
        #[arg(short, long)]
        prefix: Option<String>,

        /// Address returned for the apex and accepted queries
        #[arg(long = "ip", value_name = "IPV4")]
        presence_ip: Option<Ipv4Addr>,

        /// Listen address (UDP and TCP)
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Listen port, keeping the configured address
        #[arg(long, conflicts_with = "listen")]
        port: Option<u16>,

        /// Directory for reconstructed files
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Session keying: "domain" or "address"
        #[arg(long)]
        key_policy: Option<KeyPolicy>,

        /// Missing chunks: "zero" or "skip"
        #[arg(long)]
        gap_fill: Option<GapFill>,

        /// Highest chunk index accepted per transfer
        #[arg(long)]
        max_chunk_index: Option<u64>,

        /// Emit JSON-lines transfer events on stdout
        #[arg(long)]
        json_events: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let file_config = match &cli.config {
        Some(path) => FerryConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FerryConfig::default(),
    };

    match cli.command {
        Commands::Send {
            file,
            domain,
            server,
            prefix,
            delay,
            chunk_size,
            resolver,
        } => {
            let mut config = file_config.sender.unwrap_or_default();
            override_opt(&mut config.domain, domain);
            if prefix.is_some() {
                config.prefix = prefix;
            }
            if server.is_some() {
                config.server = server;
            }
            override_opt(&mut config.delay, delay);
            override_opt(&mut config.chunk_size, chunk_size);
            override_opt(&mut config.bootstrap_resolver, resolver);

            run_send(&file, config).await?;
        }
        Commands::Plan {
            file,
            domain,
            prefix,
            chunk_size,
        } => {
            let mut config = file_config.sender.unwrap_or_default();
            override_opt(&mut config.domain, domain);
            if prefix.is_some() {
                config.prefix = prefix;
            }
            override_opt(&mut config.chunk_size, chunk_size);

            print_plan(&file, config)?;
        }
        Commands::Serve {
            domain,
            prefix,
            presence_ip,
            listen,
            port,
            output,
            key_policy,
            gap_fill,
            max_chunk_index,
            json_events,
        } => {
            let mut config = file_config.receiver.unwrap_or_default();
            override_opt(&mut config.domain, domain);
            if prefix.is_some() {
                config.prefix = prefix;
            }
            override_opt(&mut config.presence_ip, presence_ip);
            override_opt(&mut config.listen_addr, listen);
            if let Some(port) = port {
                config.listen_addr.set_port(port);
            }
            override_opt(&mut config.output_root, output);
            override_opt(&mut config.key_policy, key_policy);
            override_opt(&mut config.gap_fill, gap_fill);
            override_opt(&mut config.max_chunk_index, max_chunk_index);
            config.json_events |= json_events;

            run_serve(config).await?;
        }
    }

    Ok(())
}

fn override_opt<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn planner_for(file: &Path, config: &SenderConfig) -> Result<ChunkPlanner> {
    let planner = ChunkPlanner::from_file(file, config.base_domain(), config.chunk_size)?
        .with_budget(config.budget_aware);
    Ok(planner)
}

async fn run_send(file: &Path, config: SenderConfig) -> Result<()> {
    config.validate()?;

    // Read the file before any network activity
    let planner = planner_for(file, &config)?;
    let server = server_address(&config).await?;
    info!("Using server → {}", server);
    info!("Using domain → {}", config.base_domain());

    let sender = Sender::new(UdpQuerySender::new(server, config.timeout), config.delay);
    let report = sender.run(&planner).await;

    info!(
        "Sent {} chunks ({} bytes) → {} [{} failed]",
        report.chunks, report.bytes, server, report.failed
    );
    debug!("Transfer report: {}", serde_json::to_string(&report)?);
    Ok(())
}

/// Explicit address, hostname lookup, or lookup of the base domain itself
async fn server_address(config: &SenderConfig) -> Result<SocketAddr> {
    let target = match config.server.as_deref() {
        Some(s) => {
            if let Ok(addr) = s.parse::<SocketAddr>() {
                return Ok(addr);
            }
            if let Ok(ip) = s.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, config.port));
            }
            s.to_string()
        }
        None => config.domain.clone(),
    };

    let ip = resolve_server(&target, config.bootstrap_resolver, config.timeout)
        .await
        .with_context(|| {
            format!(
                "No usable A/NS address for {} via {}",
                target, config.bootstrap_resolver
            )
        })?;

    Ok(SocketAddr::new(ip, config.port))
}

fn print_plan(file: &Path, config: SenderConfig) -> Result<()> {
    config.validate()?;
    let planner = planner_for(file, &config)?;

    for query in planner.plan() {
        println!("{}", query.name);
    }
    Ok(())
}

async fn run_serve(config: ReceiverConfig) -> Result<()> {
    if config.domain.is_empty() {
        bail!("--domain is required to serve");
    }
    config.validate()?;

    let engine = Arc::new(ReassemblyEngine::from_config(&config));
    let listener = Listener::bind(config.listen_addr, engine)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let addr = listener.local_addr()?;
    info!(
        "Serving {} → IP {} (output: {})",
        config.base_domain(),
        config.presence_ip,
        config.output_root.display()
    );
    if config.json_events {
        JsonLogger::listener_start(
            "listener",
            &addr.to_string(),
            config.base_domain().as_str(),
            listener.engine().policy_name(),
        );
    }

    let engine = Arc::clone(listener.engine());
    tokio::select! {
        result = listener.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown");
        }
    }

    let stats = engine.stats();
    info!(
        "Served {} queries: {} files written, {} chunks dropped, {} orphaned, {} sessions left open",
        stats.queries,
        stats.files_flushed,
        stats.chunks_dropped,
        stats.orphans,
        engine.active_sessions()
    );
    if config.json_events {
        JsonLogger::listener_stop("listener", &stats);
    }

    Ok(())
}
