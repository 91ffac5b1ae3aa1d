// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use hyperd::daemon::{Daemon, DaemonParams};
use hyperd::driver::qemu::QemuDriver;
use hyperd::network::BridgeNetwork;
use hyperd::runtime::LocalRuntime;
use hyperd::storage::DirStorage;
use hyperd::store::FileStore;
use slog::{info, warn, Logger};

const DEFAULT_CONFIG: &str = "/etc/hyper/config.toml";

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

#[derive(Debug, clap::Args)]
struct Common {
    /// Daemon configuration file
    #[clap(long, default_value = DEFAULT_CONFIG, action)]
    config: PathBuf,

    /// Logging level for the daemon
    #[clap(
        long,
        default_value_t = slog::Level::Info,
        value_parser = parse_log_level
    )]
    log_level: slog::Level,
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A daemon running pods in hypervisor-backed sandbox VMs
enum Args {
    /// Runs the daemon until interrupted. VMs keep running when it exits
    /// and are picked up again by the next run.
    Run {
        #[clap(flatten)]
        common: Common,
    },
    /// Receives one migrating pod, then runs the daemon.
    Listen {
        #[clap(name = "IP:PORT", action)]
        addr: SocketAddr,

        #[clap(flatten)]
        common: Common,
    },
    /// Moves a running pod to a host waiting in `listen`.
    Migrate {
        #[clap(action)]
        pod: String,

        #[clap(name = "IP:PORT", action)]
        addr: SocketAddr,

        #[clap(flatten)]
        common: Common,
    },
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("hyperd", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), slog::o!())
}

fn build_daemon(log: &Logger, config_path: &Path) -> anyhow::Result<Daemon> {
    let config = hyperd_config::parse(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;

    let store = FileStore::open(&config.store_dir()).context("opening store")?;
    let storage =
        DirStorage::new(&config.storage_root()).context("opening storage")?;
    let runtime = LocalRuntime::new(&config.storage_root().join("containers"));
    let network =
        BridgeNetwork::new(log, &config.network).context("network setup")?;
    let driver = QemuDriver::new(&config);

    Ok(Daemon::new(
        log,
        DaemonParams {
            config,
            store: Arc::new(store),
            storage: Arc::new(storage),
            runtime: Arc::new(runtime),
            driver: Arc::new(driver),
            network: Arc::new(network),
        },
    ))
}

async fn serve(log: &Logger, daemon: &Daemon) -> anyhow::Result<()> {
    info!(log, "daemon running"; "vms" => daemon.vms().len());
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!(log, "interrupted; releasing vms");
    daemon.release_all().await?;
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let common = match &args {
        Args::Run { common } => common,
        Args::Listen { common, .. } => common,
        Args::Migrate { common, .. } => common,
    };
    let log = build_logger(common.log_level);
    let daemon = build_daemon(&log, &common.config)?;
    let restored = daemon.restore().await?;
    info!(log, "restored pods"; "count" => restored);

    match args {
        Args::Run { .. } => serve(&log, &daemon).await,
        Args::Listen { addr, .. } => {
            let resp = daemon.listen_pod(addr).await?;
            if !resp.is_success() {
                return Err(anyhow!("cannot receive pod: {}", resp));
            }
            info!(log, "receiving pod"; "vm" => &resp.vm_id);
            serve(&log, &daemon).await
        }
        Args::Migrate { pod, addr, .. } => {
            let resp = daemon.migrate_pod(&pod, addr).await?;
            daemon.release_all().await?;
            if !resp.is_success() {
                warn!(log, "migration failed";
                    "pod" => &pod, "response" => %resp);
                return Err(anyhow!("migration of {} failed: {}", pod, resp));
            }
            info!(log, "pod migrated"; "pod" => &pod, "dest" => %addr);
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tokio-rt-hyperd")
        .build()?;
    rt.block_on(run(args))
}
