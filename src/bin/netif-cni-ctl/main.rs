use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netif_cni::config::{parse_subnet, PluginSettings};
use netif_cni::ledger::{Ledger, LedgerMode};

mod generate;

use generate::{generate_network_config, GenerateArgs};

/// Inspect and maintain the netif-cni plugin's host state
#[derive(Parser)]
#[command(name = "netif-cni-ctl", author, version, about)]
struct Cli {
    /// Root directory of the allocation ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "netif-network")]
        name: String,

        /// Subnet addresses are drawn from (CIDR notation)
        #[arg(long)]
        subnet: String,

        /// Gateway address inside the subnet
        #[arg(long)]
        gateway: Option<String>,

        /// Host bridge to attach the host end to
        #[arg(long)]
        bridge: Option<String>,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List addresses issued from a subnet
    Leases {
        /// Subnet to inspect (CIDR notation)
        #[arg(long)]
        subnet: String,
    },

    /// Return an address to the pool, e.g. after a failed ADD
    Release {
        /// Subnet the address belongs to (CIDR notation)
        #[arg(long)]
        subnet: String,

        /// Address to release
        #[arg(long)]
        ip: Ipv4Addr,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PluginSettings::default().data_dir);

    match cli.command {
        Commands::Generate {
            name,
            subnet,
            gateway,
            bridge,
            mtu,
            output,
        } => {
            let config = generate_network_config(GenerateArgs {
                name: &name,
                subnet: &subnet,
                gateway: gateway.as_deref(),
                bridge: bridge.as_deref(),
                mtu,
                data_dir: cli.data_dir,
            })?;

            let config_json = serde_json::to_string_pretty(&config)?;

            if let Some(path) = output {
                fs::write(&path, config_json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }

        Commands::Leases { subnet } => {
            let subnet = parse_subnet(&subnet)?;
            let ledger = Ledger::open(&data_dir, subnet, LedgerMode::ReadOnly)?;
            let leases = ledger.entries();

            if leases.is_empty() {
                println!("No addresses issued from {}", subnet);
            } else {
                println!("Addresses issued from {}:", subnet);
                for (ip, lease) in leases.into_iter().sorted_by_key(|(ip, _)| *ip) {
                    println!("  {:<15} {} ({})", ip, lease.container_id, lease.if_name);
                }
            }
            if !ledger.released().is_empty() {
                println!(
                    "Released: {}",
                    ledger.released().iter().map(ToString::to_string).join(", ")
                );
            }
        }

        Commands::Release { subnet, ip } => {
            let subnet = parse_subnet(&subnet)?;
            if !subnet.contains(ip) {
                anyhow::bail!("{} is outside subnet {}", ip, subnet);
            }
            let mut ledger = Ledger::open(&data_dir, subnet, LedgerMode::ReadWrite)?;
            if ledger.force_release(ip) {
                ledger.commit()?;
                info!("released {} from {}", ip, subnet);
                println!("Released {}", ip);
            } else {
                println!("{} was not issued from {}", ip, subnet);
            }
        }
    }

    Ok(())
}
