//! `ringwayd`: build ring files and run a ring transport node.
//!
//! # Usage
//!
//! ```text
//! ringwayd create -r 3 -b 10                       # new builder file
//! ringwayd add-node -a 10.0.0.1:7400 -t zone-a -t rack-1 -w 2
//! ringwayd remove-node 4
//! ringwayd build                                   # builder -> ring file
//! ringwayd show cluster.ring                       # summarize a ring or builder
//! ringwayd serve --local-node 1 -m 1 -m 2          # accept and log frames
//! ```

mod config;
mod handler;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ringway_net::TcpMsgRing;
use ringway_placement::{
    Builder, DEFAULT_PARTITION_BITS, NodeId, Ring, RingOrBuilder, load_ring_or_builder,
    persist_to_path,
};
use tracing::{info, warn};

use config::CliConfig;
use handler::FrameLogger;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "ringwayd",
    version,
    about = "Partition ring builder and transport node"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty builder file.
    Create {
        /// Builder file (defaults to `[node] builder_path`).
        #[arg(long)]
        builder: Option<PathBuf>,

        /// Distinct owners per partition.
        #[arg(short, long, default_value_t = 3)]
        replicas: usize,

        /// The ring has 2^bits partitions.
        #[arg(short = 'b', long, default_value_t = DEFAULT_PARTITION_BITS)]
        partition_bits: u16,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Add a node to a builder file.
    AddNode {
        #[arg(long)]
        builder: Option<PathBuf>,

        /// Network address; repeat for more. The first one is dialed.
        #[arg(short, long = "address", required = true)]
        addresses: Vec<String>,

        /// Tier, most general first; repeat for nested tiers.
        #[arg(short, long = "tier")]
        tiers: Vec<String>,

        /// Relative capacity weight.
        #[arg(short = 'w', long, default_value_t = 1)]
        capacity: u32,

        /// Add the node without assigning it partitions.
        #[arg(long)]
        inactive: bool,

        /// Free-form description.
        #[arg(long, default_value = "")]
        meta: String,

        /// Opaque per-node configuration, stored as UTF-8 bytes.
        #[arg(long, default_value = "")]
        conf: String,
    },

    /// Remove a node from a builder file.
    RemoveNode {
        #[arg(long)]
        builder: Option<PathBuf>,

        /// ID of the node to remove.
        id: NodeId,
    },

    /// Build a new ring from a builder file.
    Build {
        #[arg(long)]
        builder: Option<PathBuf>,

        /// Ring file (defaults to `[node] ring_path`).
        #[arg(long)]
        ring: Option<PathBuf>,
    },

    /// Summarize a ring or builder file.
    Show {
        /// File to read (defaults to `[node] ring_path`).
        path: Option<PathBuf>,
    },

    /// Accept frames from ring peers and log them.
    Serve {
        #[arg(long)]
        ring: Option<PathBuf>,

        /// This node's ID in the ring.
        #[arg(short = 'n', long)]
        local_node: Option<NodeId>,

        /// Listen address override.
        #[arg(short, long)]
        listen: Option<String>,

        /// Message type to accept; repeat for more.
        #[arg(short = 'm', long = "msg-type")]
        msg_types: Vec<u64>,
    },
}

/// Attributes of a node to add.
struct NodeArgs {
    active: bool,
    capacity: u32,
    tiers: Vec<String>,
    addresses: Vec<String>,
    meta: String,
    conf: Vec<u8>,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Create {
            builder,
            replicas,
            partition_bits,
            force,
        } => {
            let path = builder.unwrap_or(config.node.builder_path);
            cmd_create(&path, replicas, partition_bits, force)
        }
        Commands::AddNode {
            builder,
            addresses,
            tiers,
            capacity,
            inactive,
            meta,
            conf,
        } => {
            let path = builder.unwrap_or(config.node.builder_path);
            let args = NodeArgs {
                active: !inactive,
                capacity,
                tiers,
                addresses,
                meta,
                conf: conf.into_bytes(),
            };
            let id = cmd_add_node(&path, &args)?;
            println!("added node {id}");
            Ok(())
        }
        Commands::RemoveNode { builder, id } => {
            let path = builder.unwrap_or(config.node.builder_path);
            cmd_remove_node(&path, id)?;
            println!("removed node {id}");
            Ok(())
        }
        Commands::Build { builder, ring } => {
            let builder_path = builder.unwrap_or(config.node.builder_path);
            let ring_path = ring.unwrap_or(config.node.ring_path);
            cmd_build(&builder_path, &ring_path)?;
            Ok(())
        }
        Commands::Show { path } => {
            let path = path.unwrap_or(config.node.ring_path);
            cmd_show(&path)
        }
        Commands::Serve {
            ring,
            local_node,
            listen,
            msg_types,
        } => {
            // CLI args override config file values.
            if let Some(path) = ring {
                config.node.ring_path = path;
            }
            if local_node.is_some() {
                config.node.local_node = local_node;
            }
            if listen.is_some() {
                config.node.listen_addr = listen;
            }
            if !msg_types.is_empty() {
                config.node.msg_types = msg_types;
            }
            cmd_serve(config).await
        }
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// Builder and ring files
// -----------------------------------------------------------------------

fn load_builder(path: &Path) -> Result<Builder> {
    match load_ring_or_builder(path)
        .with_context(|| format!("failed to read {}", path.display()))?
    {
        RingOrBuilder::Builder(builder) => Ok(builder),
        RingOrBuilder::Ring(_) => bail!("{} is a ring file, not a builder", path.display()),
    }
}

fn load_ring(path: &Path) -> Result<Ring> {
    match load_ring_or_builder(path)
        .with_context(|| format!("failed to read {}", path.display()))?
    {
        RingOrBuilder::Ring(ring) => Ok(ring),
        RingOrBuilder::Builder(_) => bail!("{} is a builder file, not a ring", path.display()),
    }
}

fn save<P: ringway_placement::Persist>(value: &P, path: &Path) -> Result<()> {
    persist_to_path(value, path).with_context(|| format!("failed to write {}", path.display()))
}

fn cmd_create(path: &Path, replicas: usize, partition_bits: u16, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut builder = Builder::new();
    builder.set_replica_count(replicas)?;
    builder.set_partition_bits(partition_bits)?;
    save(&builder, path)?;
    info!(path = %path.display(), replicas, partition_bits, "created builder");
    Ok(())
}

fn cmd_add_node(path: &Path, args: &NodeArgs) -> Result<NodeId> {
    let mut builder = load_builder(path)?;
    let tiers: Vec<&str> = args.tiers.iter().map(String::as_str).collect();
    let addresses: Vec<&str> = args.addresses.iter().map(String::as_str).collect();
    let node = builder.add_node(
        args.active,
        args.capacity,
        &tiers,
        &addresses,
        &args.meta,
        &args.conf,
    )?;
    save(&builder, path)?;
    Ok(node.id())
}

fn cmd_remove_node(path: &Path, id: NodeId) -> Result<()> {
    let mut builder = load_builder(path)?;
    builder.remove_node(id)?;
    save(&builder, path)
}

/// Build a ring, then persist the ring and the builder that produced it.
fn cmd_build(builder_path: &Path, ring_path: &Path) -> Result<Ring> {
    let mut builder = load_builder(builder_path)?;
    let previous = if ring_path.exists() {
        match load_ring(ring_path) {
            Ok(ring) => Some(ring),
            Err(e) => {
                warn!(path = %ring_path.display(), error = %e, "ignoring unreadable ring file");
                None
            }
        }
    } else {
        None
    };

    let ring = builder.ring().context("failed to build ring")?;
    save(&ring, ring_path)?;
    save(&builder, builder_path)?;

    let moved = previous.as_ref().map(|old| old.moved_partitions(&ring));
    match moved {
        Some(moved) => println!(
            "built ring version {} ({moved} of {} partitions moved)",
            ring.version(),
            ring.partition_count()
        ),
        None => println!("built ring version {}", ring.version()),
    }
    Ok(ring)
}

fn cmd_show(path: &Path) -> Result<()> {
    let record =
        load_ring_or_builder(path).with_context(|| format!("failed to read {}", path.display()))?;
    print!("{}", describe(&record));
    Ok(())
}

/// Human-readable summary of a ring or builder.
fn describe(record: &RingOrBuilder) -> String {
    let mut out = String::new();
    match record {
        RingOrBuilder::Ring(ring) => {
            let _ = writeln!(
                out,
                "ring version {}: {} replicas, {} partitions, {} nodes",
                ring.version(),
                ring.replica_count(),
                ring.partition_count(),
                ring.nodes().len()
            );
            if let Some(local) = ring.local_node_id() {
                let _ = writeln!(out, "local node {local}");
            }
            let mut owned = vec![0usize; ring.nodes().len()];
            for partition in 0..ring.partition_count() {
                for id in ring.responsible_ids(partition) {
                    if let Ok(index) = ring.nodes().binary_search_by_key(id, |n| n.id()) {
                        owned[index] += 1;
                    }
                }
            }
            for (node, owned) in ring.nodes().iter().zip(owned) {
                let _ = writeln!(
                    out,
                    "  node {} active={} capacity={} tiers=[{}] addresses=[{}] partitions={owned} {}",
                    node.id(),
                    node.active(),
                    node.capacity(),
                    node.tiers().join(","),
                    node.addresses().join(","),
                    node.meta()
                );
            }
        }
        RingOrBuilder::Builder(builder) => {
            let _ = writeln!(
                out,
                "builder version {}: {} replicas, {} partition bits, {} nodes",
                builder.version(),
                builder.replica_count(),
                builder.partition_bits(),
                builder.nodes().count()
            );
            for node in builder.nodes() {
                let _ = writeln!(
                    out,
                    "  node {} active={} capacity={} tiers=[{}] addresses=[{}] {}",
                    node.id(),
                    node.active(),
                    node.capacity(),
                    node.tiers().join(","),
                    node.addresses().join(","),
                    node.meta()
                );
            }
        }
    }
    out
}

// -----------------------------------------------------------------------
// ringwayd serve
// -----------------------------------------------------------------------

async fn cmd_serve(config: CliConfig) -> Result<()> {
    let ring = load_ring(&config.node.ring_path)?;
    let ring = match config.node.local_node {
        Some(id) => ring
            .with_local_node(id)
            .with_context(|| format!("node {id} is not in the ring"))?,
        None if ring.local_node_id().is_some() => ring,
        None => bail!("no local node: pass --local-node or set [node] local_node"),
    };
    if config.node.msg_types.is_empty() {
        warn!("no message types configured; every inbound frame will be rejected");
    }

    let transport = TcpMsgRing::with_config(ring, config.transport.msg_ring_config());
    for msg_type in &config.node.msg_types {
        transport.set_msg_handler(*msg_type, Arc::new(FrameLogger::new(*msg_type)));
    }

    let listen_addr = match config.node.listen_addr.clone() {
        Some(addr) => addr,
        None => transport.local_address()?,
    };
    let listener = transport
        .listen(&listen_addr)
        .await
        .with_context(|| format!("failed to listen on {listen_addr}"))?;

    let ring = transport.ring();
    info!(
        addr = %listen_addr,
        version = ring.version(),
        local_node = ?ring.local_node_id(),
        partitions = ring.local_partitions().len(),
        msg_types = ?config.node.msg_types,
        "serving"
    );

    let mut faults = transport.subscribe_faults();
    tokio::spawn(async move {
        while let Ok(fault) = faults.recv().await {
            warn!(addr = %fault.addr, error = %fault.error, timeout = fault.timeout, "connection fault");
        }
    });

    let server = transport.clone();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("shutting down");
    transport.shutdown().await;
    serving.await??;
    Ok(())
}
