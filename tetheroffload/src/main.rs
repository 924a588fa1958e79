mod backends;
mod config;
mod coordinator;
mod error;
mod events;
mod rule;
mod service;
mod stats;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::signal;

use crate::backends::attach::create_attacher;
use crate::backends::conntrack::CommandConntrackMonitor;
use crate::backends::offload::{BackendSource, open_pinned_maps};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorDeps};
use crate::stats::JsonLinesSink;

/// tetheroffload - kernel offload coordinator for tethered traffic
#[derive(Parser, Debug)]
#[command(name = "tetheroffload")]
#[command(version = "0.1.0")]
#[command(about = "Keeps kernel forwarding rules, data limits and traffic stats of tethered interfaces in sync", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/tetheroffload/offload.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Probe the pinned kernel maps, print what is available and exit
    #[arg(long)]
    list_capabilities: bool,

    /// Write the effective configuration (defaults filled in) and exit
    #[arg(long)]
    save_config: bool,

    /// Don't start stats polling at startup
    #[arg(long)]
    no_poll: bool,

    /// Debug logging regardless of RUST_LOG
    #[arg(long, short)]
    verbose: bool,
}

fn print_capabilities(config: &Config) {
    println!("tetheroffload v0.1.0 - Offload Capabilities\n");

    println!("Kernel maps ({}):", config.map_pin_dir.display());
    let maps = open_pinned_maps(config);
    for ((label, file), (_, available)) in config.map_names.all().iter().zip(maps.availability()) {
        let status = if available {
            "✅ available"
        } else {
            "❌ unavailable"
        };
        println!("  {:12} {:40} {}", label, file, status);
    }

    println!();
    if maps.missing().is_empty() {
        println!("Backend: map-based");
    } else {
        println!("Backend: disabled (missing {})", maps.missing().join(", "));
    }

    println!();
    match &config.program_object {
        Some(object) => {
            println!("Program object: {}", object.display());
            println!("  upstream program:   {}", config.upstream_program);
            println!("  downstream program: {}", config.downstream_program);
        }
        None => println!("Program object: (not configured, attachment disabled)"),
    }
    if cfg!(feature = "offload-ebpf") {
        println!("eBPF support: compiled in");
    } else {
        println!("eBPF support: not compiled in (build with --features offload-ebpf)");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Debug)
            .parse_default_env()
            .init();
    } else if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let config = Config::load(args.config.as_deref())?;

    if args.save_config {
        config.save(args.config.as_deref())?;
        return Ok(());
    }

    if args.list_capabilities {
        print_capabilities(&config);
        return Ok(());
    }

    let deps = CoordinatorDeps {
        backend: BackendSource::Maps(open_pinned_maps(&config)),
        sink: Box::new(JsonLinesSink::new(std::io::stdout())),
        conntrack: Box::new(CommandConntrackMonitor::new(config.conntrack_command.clone())),
        attacher: create_attacher(&config),
        config,
    };
    let coordinator = Coordinator::new(deps);
    match coordinator.mode() {
        Some(mode) => log::info!("✅ Tethering offload enabled ({})", mode),
        None => log::warn!("⚠️  Tethering offload disabled, events will be ignored"),
    }

    let handle = service::spawn(coordinator);

    if !args.no_poll {
        if let Some(interval) = handle.start_polling().await? {
            log::info!("Polling offload stats every {:?}", interval);
        }
    }

    tokio::select! {
        result = events::run_event_feed(BufReader::new(tokio::io::stdin()), &handle) => {
            match result {
                Ok(()) => log::info!("Event feed closed, shutting down"),
                Err(e) => log::error!("❌ {:#}", e),
            }
        }
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down");
        }
    }

    handle.shutdown().await?;
    Ok(())
}
