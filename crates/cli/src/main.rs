//! `hetu` — server launcher and maintenance commands.
//!
//! The transport layer (websocket framing, compression/crypto) is provided
//! by the embedding application; this binary wires up the kernel: storage
//! backend, cluster build, head-node maintenance, worker id leases and the
//! future-call pollers.

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hetu::db::backend::{Backend, BackendClient};
use hetu::endpoint::connection::connection_def;
use hetu::manager::ComponentTableManager;
use hetu::snowflake::{SnowflakeId, keep_alive_task};
use hetu::system::future::{future_call_task, future_calls_def};
use hetu::system::lock::system_lock_def;
use hetu::system::{SystemDef, SystemExecutor, SystemRegistry};
use hetu::MemBackend;

use config::Config;

#[derive(Parser)]
#[command(name = "hetu", about = "HeTu logic database server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Project namespace; required unless --config provides it.
    #[arg(long)]
    namespace: Option<String>,
    /// Deployment instance name; required unless --config provides it.
    #[arg(long)]
    instance: Option<String>,
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Storage engine url (`mem` = embedded engine).
    #[arg(long)]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server workers.
    Start {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workers: Option<usize>,
        /// Perform head-node startup maintenance (schema checks, volatile
        /// flush) before serving.
        #[arg(long)]
        head: bool,
        #[arg(long)]
        debug: bool,
    },
    /// Emit the component schemas consumed by client-SDK generators.
    Build {
        #[command(flatten)]
        common: CommonArgs,
        /// Output directory for the schema JSON files.
        #[arg(long, default_value = "build")]
        output: PathBuf,
    },
    /// Apply pending schema migrations and cluster moves, then exit.
    Migrate {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn resolve_config(common: &CommonArgs) -> anyhow::Result<Config> {
    let mut cfg = match &common.config {
        Some(path) => Config::load(path)?,
        None => {
            let namespace = common
                .namespace
                .clone()
                .context("--namespace is required without --config")?;
            let instance = common
                .instance
                .clone()
                .context("--instance is required without --config")?;
            Config::bare(namespace, instance)
        }
    };
    if let Some(ns) = &common.namespace {
        cfg.namespace = ns.clone();
    }
    if let Some(instance) = &common.instance {
        cfg.instance = instance.clone();
    }
    if let Some(db) = &common.db {
        cfg.db = db.clone();
    } else if let Ok(db) = std::env::var("HETU_DB") {
        cfg.db = db;
    }
    Ok(cfg)
}

struct Kernel {
    backend: Arc<Backend>,
    client: Arc<MemBackend>,
    registry: Arc<SystemRegistry>,
    manager: Arc<ComponentTableManager>,
}

/// Assemble the kernel: storage client, builtin components and systems,
/// clusters and the table manager. Application systems register through the
/// embedding API; standalone runs carry only the builtins.
fn build_kernel(cfg: &Config, process_ordinal: u32) -> anyhow::Result<Kernel> {
    if cfg.db != "mem" {
        bail!(
            "unknown storage engine `{}`; the embedded `mem` engine is the only one bundled",
            cfg.db
        );
    }
    let client = Arc::new(MemBackend::new());
    let keeper = client.worker_keeper(process_ordinal);
    let ids = Arc::new(SnowflakeId::from_keeper(keeper.as_ref())?);
    let backend = Arc::new(Backend::new(client.clone(), ids));

    let connection = connection_def();
    let lock = system_lock_def();
    let future = future_calls_def();

    let mut registry = SystemRegistry::new();
    // Builtin components need at least one transactional reference each to
    // get a table; this system is that anchor.
    registry
        .define(
            SystemDef::builder("pin_builtins")
                .namespace(&cfg.namespace)
                .component(&connection)
                .component(&lock)
                .component(&future)
                .permission(hetu_lib::Permission::Admin)
                .build(),
        )
        .map_err(|e| anyhow::anyhow!(e))?;
    registry
        .build_clusters(&cfg.namespace)
        .map_err(|e| anyhow::anyhow!(e))?;
    let registry = Arc::new(registry);

    let mut backends = HashMap::new();
    backends.insert("default".to_owned(), backend.clone());
    let manager = Arc::new(
        ComponentTableManager::new(
            &cfg.namespace,
            &cfg.instance,
            backends,
            &registry.table_assignments(&cfg.namespace),
        )
        .map_err(|e| anyhow::anyhow!(e))?,
    );

    Ok(Kernel {
        backend,
        client,
        registry,
        manager,
    })
}

async fn run_start(cfg: Config) -> anyhow::Result<()> {
    let kernel = build_kernel(&cfg, 0)?;

    if cfg.head {
        log::info!("head node: checking tables and flushing volatile data");
        kernel
            .manager
            .create_or_migrate_all(false)
            .await
            .map_err(|e| anyhow::anyhow!("startup refused: {e}"))?;
        kernel
            .manager
            .flush_volatile()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Worker-id lease renewal; losing the lease is fatal by design. The
    // keeper re-attaches to the lease taken when the generator was built.
    let keeper = kernel.client.worker_keeper(0);
    keeper.acquire().map_err(|e| anyhow::anyhow!(e))?;
    let ids = kernel.backend.ids().clone();
    tasks.push(tokio::spawn(keep_alive_task(keeper, ids, cancel.clone())));

    let executor = Arc::new(SystemExecutor::new(
        cfg.namespace.clone(),
        kernel.registry.clone(),
        kernel.manager.clone(),
    ));
    for _ in 0..cfg.workers.max(1) {
        tasks.push(tokio::spawn(future_call_task(
            executor.clone(),
            cancel.clone(),
        )));
    }

    log::info!(
        "hetu kernel up: namespace={} instance={} port={} workers={}",
        cfg.namespace,
        cfg.instance,
        cfg.port,
        cfg.workers
    );
    log::info!("motd: {}", cfg.motd);

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    cancel.cancel();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => bail!("worker task failed: {e}"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => bail!("worker task panicked: {e}"),
        }
    }
    Ok(())
}

async fn run_migrate(cfg: Config) -> anyhow::Result<()> {
    let kernel = build_kernel(&cfg, 0)?;
    kernel
        .manager
        .create_or_migrate_all(true)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    log::info!("migration complete");
    Ok(())
}

fn run_build(cfg: Config, output: PathBuf) -> anyhow::Result<()> {
    let kernel = build_kernel(&cfg, 0)?;
    std::fs::create_dir_all(&output)?;
    let mut count = 0usize;
    for (comp, _) in kernel.registry.table_assignments(&cfg.namespace) {
        let file = output.join(format!("{}.json", comp.name().replace(':', "_")));
        std::fs::write(&file, comp.json())?;
        count += 1;
    }
    log::info!("wrote {count} component schemas to {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Command::Start { debug: true, .. });
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    let result = match cli.command {
        Command::Start { common, port, workers, head, debug } => {
            resolve_config(&common).and_then(|mut cfg| {
                if let Some(port) = port {
                    cfg.port = port;
                }
                if let Some(workers) = workers {
                    cfg.workers = workers;
                }
                cfg.head |= head;
                cfg.debug |= debug;
                runtime()?.block_on(run_start(cfg))
            })
        }
        Command::Migrate { common } => {
            resolve_config(&common).and_then(|cfg| runtime()?.block_on(run_migrate(cfg)))
        }
        Command::Build { common, output } => {
            resolve_config(&common).and_then(|cfg| run_build(cfg, output))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")
}
