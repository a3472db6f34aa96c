use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

mod booster;
mod config;
mod dispatcher;
mod logger;
mod network;
mod protocol;
mod pubsub;
mod socks;
mod tracer;

use crate::booster::{Booster, InspectItem};
use crate::config::{Settings, SAMPLE_CONFIG};
use crate::logger::StructuredLogger;
use crate::network::Runtime;
use crate::protocol::MessageKind;

const CONFIG_PATH: &str = "config.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Starts a booster node: SOCKS5 proxy plus control plane.
    Start {
        #[clap(long, help = "proxy listening port")]
        pport: Option<u16>,
        #[clap(long, help = "booster listening port")]
        bport: Option<u16>,
        #[clap(long, default_value = CONFIG_PATH)]
        config: String,
    },
    /// Pairs a booster node with a remote one.
    Connect {
        #[clap(short = 'b', long, default_value = ":4884", help = "booster address")]
        baddr: String,
        /// Control-plane address of the node to wire with, host:port.
        target: String,
    },
    /// Disconnects a previously connected remote node.
    Disconnect {
        #[clap(short = 'b', long, default_value = ":4884", help = "booster address")]
        baddr: String,
        /// Identifier of the node to drop.
        id: String,
    },
    /// Streams state updates from a booster node.
    Inspect {
        #[clap(short = 'b', long, default_value = ":4884", help = "booster address")]
        baddr: String,
        #[clap(long, default_value = "node,bandwidth")]
        features: String,
    },
    /// Generates a sample config.toml file.
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => exit(0),
            _ => exit(1),
        }
    });

    if !matches!(cli.command, Commands::Start { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Start {
            pport,
            bport,
            config,
        } => {
            if let Err(e) = start(pport, bport, &config).await {
                error!("booster: {:#}", e);
                exit(2);
            }
        }
        Commands::Connect { baddr, target } => {
            let baddr = normalize(&baddr);
            match booster::connect_cmd(&baddr, &target).await {
                Ok(node) => println!("connected to ({}): {}", target, node.id),
                Err(e) => {
                    eprintln!("{:#}", e);
                    exit(2);
                }
            }
        }
        Commands::Disconnect { baddr, id } => {
            let baddr = normalize(&baddr);
            match booster::disconnect_cmd(&baddr, &id).await {
                Ok(node) => println!("disconnected from: {}", node.id),
                Err(e) => {
                    eprintln!("{:#}", e);
                    exit(2);
                }
            }
        }
        Commands::Inspect { baddr, features } => {
            let baddr = normalize(&baddr);
            let features = parse_features(&features)?;
            let res = tokio::select! {
                res = booster::inspect_cmd(&baddr, &features, print_item) => res,
                _ = tokio::signal::ctrl_c() => {
                    exit(130);
                }
            };
            if let Err(e) = res {
                eprintln!("{:#}", e);
                exit(2);
            }
        }
        Commands::GenConfig => {
            std::fs::write(CONFIG_PATH, SAMPLE_CONFIG)?;
            println!("Sample config file '{}' created.", CONFIG_PATH);
        }
    }
    Ok(())
}

async fn start(pport: Option<u16>, bport: Option<u16>, config_path: &str) -> Result<()> {
    let settings = Settings::load(config_path).context("failed to load config")?;
    let pport = pport.unwrap_or(settings.interface.pport);
    let bport = bport.unwrap_or(settings.interface.bport);

    let level = settings
        .log
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    let log_path = if settings.log.log_path.is_empty() {
        None
    } else {
        Some(settings.log.log_path.as_str())
    };
    // tag every line with the control port: several instances on one
    // host usually share a terminal or a log file
    StructuredLogger::init(level, &bport.to_string(), log_path, settings.log.log_to_std)?;

    info!("booster: starting (pport {}, bport {})...", pport, bport);

    let rt = Runtime::new();
    let b = Booster::new(rt, pport, bport, settings.tuning());

    // trap the interrupt signal and stop the run loop cleanly
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let b = b.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("booster: signal received: exiting...");
                interrupted.store(true, Ordering::Relaxed);
                b.close();
            }
        });
    }

    let res = b.run().await;
    if interrupted.load(Ordering::Relaxed) {
        exit(130);
    }
    res
}

/// Accepts bare `:port` addresses for the local instance.
fn normalize(baddr: &str) -> String {
    if let Some(rest) = baddr.strip_prefix(':') {
        format!("localhost:{}", rest)
    } else {
        baddr.to_string()
    }
}

fn parse_features(s: &str) -> Result<Vec<MessageKind>> {
    s.split(',')
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(|f| match f {
            "node" => Ok(MessageKind::Node),
            "bandwidth" => Ok(MessageKind::Bandwidth),
            other => Err(anyhow::anyhow!("unknown feature: {}", other)),
        })
        .collect()
}

fn print_item(item: InspectItem) {
    match item {
        InspectItem::Node(n) => {
            println!(
                "node [{}] baddr {} paddr {} active {} tunnels {}",
                n.id,
                n.baddr,
                n.paddr,
                n.active,
                n.tunnels.len()
            );
            for t in &n.tunnels {
                println!("  tunnel [{}] {} copies {}", t.id, t.target, t.copies);
            }
        }
        InspectItem::Bandwidth(b) => {
            println!("bandwidth [{}] {}: {} B/s (tot {})", b.node_id, b.kind, b.bandwidth, b.tot);
        }
    }
}
