//! riakpool -- command-line access to a Riak-style cluster.
//!
//! Every command builds a node pool from the configuration, leases one
//! connection and runs a single operation. `watch` runs the health monitor
//! and prints pool events until SIGINT/SIGTERM.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use riakpool::config::{load_config, Config};
use riakpool::{BucketProperties, HealthMonitor, NodePool, Object, Quorum};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "riakpool",
    version,
    about = "Pooled client for Riak-style HTTP key-value clusters"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Node address; repeat to build a pool. Overrides the file's list.
    #[arg(short, long = "node")]
    nodes: Vec<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping every node in the pool.
    Ping,
    /// Fetch an object.
    Fetch { bucket: String, key: String },
    /// Store a value; omit --key to let the server assign one.
    Store {
        bucket: String,
        value: String,
        #[arg(long, default_value = "")]
        key: String,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        vclock: Option<String>,
    },
    /// Delete an object.
    Delete { bucket: String, key: String },
    /// Read or change bucket properties.
    Props {
        #[command(subcommand)]
        action: PropsCommand,
    },
    /// Read or change a counter.
    Counter {
        #[command(subcommand)]
        action: CounterCommand,
    },
    /// Show the node's /stats report.
    Status,
    /// List the resources the node advertises.
    Resources,
    /// Run the health monitor and print pool events.
    Watch,
}

#[derive(Subcommand, Debug)]
enum PropsCommand {
    Get {
        bucket: String,
    },
    /// Change selected properties, keeping the rest.
    Set {
        bucket: String,
        #[arg(long)]
        n_val: Option<u32>,
        #[arg(long)]
        allow_mult: Option<bool>,
        #[arg(long)]
        last_write_wins: Option<bool>,
        #[arg(long)]
        r: Option<Quorum>,
        #[arg(long)]
        w: Option<Quorum>,
        #[arg(long)]
        dw: Option<Quorum>,
        #[arg(long)]
        rw: Option<Quorum>,
    },
    Reset {
        bucket: String,
    },
}

#[derive(Subcommand, Debug)]
enum CounterCommand {
    Get {
        bucket: String,
        key: String,
    },
    Add {
        bucket: String,
        key: String,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },
}

#[derive(Serialize)]
struct ObjectView<'a> {
    bucket: &'a str,
    key: &'a str,
    content_type: Option<&'a str>,
    vclock: Option<&'a str>,
    etag: Option<&'a str>,
    value: String,
}

impl<'a> From<&'a Object> for ObjectView<'a> {
    fn from(obj: &'a Object) -> Self {
        Self {
            bucket: &obj.bucket,
            key: &obj.key,
            content_type: obj.content_type.as_deref(),
            vclock: obj.vclock.as_deref(),
            etag: obj.etag.as_deref(),
            value: String::from_utf8_lossy(&obj.value).into_owned(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if !cli.nodes.is_empty() {
        config.cluster.nodes = cli.nodes.clone();
    }
    config.debug |= cli.debug;
    let config = config.validated()?;

    init_tracing(&config);

    match config.observability.metrics_addr {
        Some(addr) => {
            riakpool::metrics::install_http_listener(addr)?;
            info!("Prometheus metrics served on {}", addr);
        }
        None => {
            riakpool::metrics::init_metrics();
        }
    }
    riakpool::metrics::describe_metrics();

    let pool = NodePool::new(&config.cluster.nodes, config.cluster.pool_options())?;
    info!("Node pool ready with {} nodes", pool.len());

    run(cli.command, &pool, &config).await
}

fn init_tracing(config: &Config) {
    let level = if config.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Command, pool: &NodePool, config: &Config) -> anyhow::Result<()> {
    if matches!(command, Command::Ping) {
        let mut failures = 0;
        for conn in pool.connections() {
            match conn.ping().await {
                Ok(()) => println!("{}: ok", conn.address()),
                Err(e) => {
                    failures += 1;
                    println!("{}: {}", conn.address(), e);
                }
            }
        }
        if failures == pool.len() {
            anyhow::bail!("no node answered");
        }
        return Ok(());
    }
    if matches!(command, Command::Watch) {
        return watch(pool).await;
    }

    let lease = pool
        .acquire_timeout(config.cluster.request_timeout())
        .await?;
    match command {
        Command::Fetch { bucket, key } => {
            let obj = lease.fetch(&bucket, &key).await?;
            print_json(&ObjectView::from(&obj))?;
        }
        Command::Store {
            bucket,
            value,
            key,
            content_type,
            vclock,
        } => {
            let mut obj = Object::new(bucket, key, Bytes::from(value));
            obj.content_type = content_type;
            obj.vclock = vclock;
            let stored = lease.store(&obj).await?;
            print_json(&ObjectView::from(&stored))?;
        }
        Command::Delete { bucket, key } => {
            lease.delete(&bucket, &key).await?;
            println!("deleted {bucket}/{key}");
        }
        Command::Props { action } => match action {
            PropsCommand::Get { bucket } => {
                print_json(&lease.get_bucket_properties(&bucket).await?)?;
            }
            PropsCommand::Set {
                bucket,
                n_val,
                allow_mult,
                last_write_wins,
                r,
                w,
                dw,
                rw,
            } => {
                let current = lease.get_bucket_properties(&bucket).await?;
                let props = BucketProperties {
                    n_val: n_val.unwrap_or(current.n_val),
                    allow_mult: allow_mult.unwrap_or(current.allow_mult),
                    last_write_wins: last_write_wins.unwrap_or(current.last_write_wins),
                    r: r.or(current.r),
                    w: w.or(current.w),
                    dw: dw.or(current.dw),
                    rw: rw.or(current.rw),
                };
                lease.set_bucket_properties(&bucket, &props).await?;
                print_json(&props)?;
            }
            PropsCommand::Reset { bucket } => {
                lease.reset_bucket_properties(&bucket).await?;
                println!("reset properties of {bucket}");
            }
        },
        Command::Counter { action } => match action {
            CounterCommand::Get { bucket, key } => {
                print_json(&lease.get_counter(&bucket, &key).await?)?;
            }
            CounterCommand::Add { bucket, key, delta } => {
                lease.update_counter(&bucket, &key, delta).await?;
                print_json(&lease.get_counter(&bucket, &key).await?)?;
            }
        },
        Command::Status => print_json(&lease.status().await?)?,
        Command::Resources => print_json(&lease.list_resources().await?)?,
        Command::Ping | Command::Watch => {}
    }
    pool.release(lease)?;
    Ok(())
}

async fn watch(pool: &NodePool) -> anyhow::Result<()> {
    let mut events = pool.subscribe();
    let monitor = HealthMonitor::new(pool.clone()).start();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} pool events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    monitor.stop();
    print_json(&pool.stats())?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
