#![warn(clippy::match_same_arms)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::unnecessary_wraps)]

use std::path::Path;

use clap::Parser;
use futures::StreamExt as _;

use powerkitd::config::{BackendKind, Config};
use powerkitd::daemon::{self, Daemon};
use powerkitd::errors::*;
use powerkitd::hooks::BusPolicyAuth;
use powerkitd::{CliArgs, rpc, signals};

fn main() {
    env_logger::init();
    let args = CliArgs::parse();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime")
        .block_on(run(args));

    if let Err(error) = result {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = Config::load(Path::new(&args.config))?;
    if let Some(backend) = &args.backend {
        config.backend = match backend.as_str() {
            "linux" => BackendKind::Linux,
            "dummy" => BackendKind::Dummy,
            other => return Err(Error::new(format!("unknown backend '{other}'"))),
        };
    }

    log::info!("powerkitd {} starting", env!("VERSION"));
    let handle = Daemon::start(config, Box::new(BusPolicyAuth)).await?;
    let daemon = handle.daemon;

    // keep the connection alive for the daemon's whole life
    let _connection = match rpc::serve(daemon.clone(), handle.signals, !args.no_bus).await {
        Ok(connection) => Some(connection),
        Err(err) if args.no_bus => {
            log::warn!("running without the bus: {err}");
            None
        }
        Err(err) => return Err(err),
    };

    let mut shutdown = signals::shutdown_stream()?;
    tokio::select! {
        _ = daemon::run(daemon.clone(), handle.events) => {}
        _ = shutdown.next() => {
            log::info!("shutting down");
        }
    }
    daemon.lock().await.flush().await;
    Ok(())
}
