use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use manifold_cluster::fetch_cluster;
use manifold_proxy::config::{self, Args};
use manifold_proxy::server;
use tracing::{debug, error, info};

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            let _ = e.print();
            return code;
        }
    };
    init_tracing(&args);
    info!("manifold-proxy v{}", env!("CARGO_PKG_VERSION"));

    let (host, port) = match config::parse_seed(&args.cluster) {
        Ok(seed) => seed,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!("cluster address: {host}:{port}");
    let cfg = args.to_config();

    let cluster = match fetch_cluster(&host, port, cfg.auth.as_deref()) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("failed to fetch cluster configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "cluster has {} master(s) and {} replica(s)",
        cluster.master_count(),
        cluster.replica_count()
    );
    for (slot, node) in cluster.slots.iter() {
        debug!("slot boundary {slot} -> node {}", node.addr());
    }

    if args.daemonize {
        if let Err(e) = daemonize::Daemonize::new().start() {
            error!("failed to daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    match server::start(cfg, cluster) {
        Ok(handle) => {
            info!("listening on port {}", handle.local_addr().port());
            handle.join();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.as_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.disable_colors)
        .init();
}
