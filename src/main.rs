//! Devmap - Host mapping of device buffers
//!
//! CLI entry point for exercising mapped buffers on the simulated host device.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devmap::config::DevmapConfig;
use devmap::{BufferState, HostDevice, MappedBuffer, Operation};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
const LOG_ENV: &str = "DEVMAP_LOG";

#[derive(Parser)]
#[command(name = "devmap")]
#[command(version)]
#[command(about = "Map device buffers into host memory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config {
        /// Config file (default: search for devmap.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Map a buffer on the host device, fill it, and read it back
    Demo {
        /// Number of f32 elements (default from config)
        #[arg(short, long)]
        elements: Option<usize>,

        /// Return from map before the mapping completes
        #[arg(long)]
        non_blocking: bool,

        /// Simulated map latency in microseconds (default from config)
        #[arg(long)]
        map_latency_us: Option<u64>,

        /// Config file (default: search for devmap.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the buffer state machine
    States,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { config, output } => {
            let config = load_config(config.as_deref())?;
            init_logging(&config);
            cmd_config(&config, output.as_deref())
        }
        Commands::Demo {
            elements,
            non_blocking,
            map_latency_us,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(elements) = elements {
                config.buffer.elements = elements;
            }
            if non_blocking {
                config.buffer.blocking = false;
            }
            if let Some(latency) = map_latency_us {
                config.queue.map_latency_us = latency;
            }
            init_logging(&config);
            cmd_demo(&config)
        }
        Commands::States => cmd_states(),
    }
}

fn load_config(path: Option<&Path>) -> Result<DevmapConfig> {
    match path {
        Some(path) => DevmapConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => DevmapConfig::load_from_cwd().context("Failed to load devmap.toml"),
    }
}

fn init_logging(config: &DevmapConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // A subscriber may already be installed when embedded; keep that one.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cmd_config(config: &DevmapConfig, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            config
                .save(path)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

fn cmd_demo(config: &DevmapConfig) -> Result<()> {
    let elements = config.buffer.elements;
    let blocking = config.buffer.blocking;
    let bytes = elements
        .checked_mul(std::mem::size_of::<f32>())
        .context("Buffer size overflows usize")?;

    let device = HostDevice::new();
    let queue = device
        .queue_with(&config.queue)
        .context("Failed to start device queue")?;

    println!("Devmap Demo");
    println!("===========");
    println!("Queue:      {}", queue.label());
    println!("Elements:   {} ({} bytes)", elements, bytes);
    println!("Blocking:   {}", blocking);
    println!("Map delay:  {:?}\n", config.queue.map_latency());

    let mut handle: MappedBuffer<f32> = MappedBuffer::new();
    handle
        .allocate(device.allocate(bytes)?)
        .context("Failed to attach device buffer")?;

    let start = Instant::now();
    let mut view = handle.map(&queue, blocking)?;
    let map_returned = start.elapsed();
    let ready_on_return = view.is_ready();
    view.wait();
    let map_ready = start.elapsed();

    for (i, value) in view.data_mut()?.iter_mut().enumerate() {
        *value = i as f32;
    }

    let start = Instant::now();
    handle.unmap(&queue)?;
    queue.finish()?;
    let unmap_done = start.elapsed();

    let buffer = handle.free()?;
    let contents = device.read_device(&buffer)?;
    let checksum: f64 = contents
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|chunk| f64::from(bytemuck::pod_read_unaligned::<f32>(chunk)))
        .sum();
    device.release(buffer)?;

    println!("Map returned after:   {:?} (ready: {})", map_returned, ready_on_return);
    println!("Mapping ready after:  {:?}", map_ready);
    println!("Unmap + finish:       {:?}", unmap_done);
    println!("Device checksum:      {}", checksum);

    let stats = queue.stats();
    println!(
        "Queue commands:       {} map, {} unmap",
        stats.maps_completed, stats.unmaps_completed
    );
    Ok(())
}

fn cmd_states() -> Result<()> {
    println!("Mapped Buffer States:");
    println!("=====================\n");

    println!("  {:<12} {:<10} {}", "STATE", "OPERATION", "RESULT");
    for state in BufferState::ALL {
        for op in Operation::ALL {
            let result = match state.after(op) {
                Some(next) => next.to_string(),
                None => "rejected".to_string(),
            };
            println!("  {:<12} {:<10} {}", state, op, result);
        }
    }
    Ok(())
}
