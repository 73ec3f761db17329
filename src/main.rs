use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvm_compute::{Compute, Config};

#[derive(Parser)]
#[command(name = "kvm-compute", version, about = "Inspect a libvirt compute node")]
struct Cli {
    #[arg(
        long,
        env = "KVM_COMPUTE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the JSON configuration file; defaults apply when omitted"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// List defined machines
    Machines,
    /// Show one machine
    Machine {
        id: String,
        #[arg(long, help = "Node that owns the machine; defaults to the configured node")]
        node: Option<String>,
    },
    /// List storage pools
    Pools,
    /// List volumes across all pools
    Volumes,
    /// List libvirt networks and configured bridges
    Networks,
    /// Show hypervisor host information
    Host,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    config.validate()?;
    // Connections open on first use.
    let compute = Compute::libvirt(&config)?;
    if !matches!(cli.command, Command::CheckConfig) {
        info!("Using {} as node {}", config.libvirt.uri, config.libvirt.node);
    }

    match cli.command {
        Command::CheckConfig => print_json(&config),
        Command::Machines => print_json(&compute.machines().list().await?),
        Command::Machine { id, node } => {
            let node = node.unwrap_or_else(|| config.libvirt.node.clone());
            print_json(&compute.machines().get(&id, &node).await?)
        }
        Command::Pools => print_json(&compute.volume_pools().list().await?),
        Command::Volumes => print_json(&compute.volumes().list().await?),
        Command::Networks => print_json(&compute.networks().list().await?),
        Command::Host => print_json(&compute.host().get().await?),
    }
}
