#![warn(clippy::match_same_arms)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::unnecessary_wraps)]

#[macro_use]
pub mod util;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod device;
pub mod device_list;
pub mod errors;
pub mod history;
pub mod hooks;
pub mod lid;
pub mod rpc;
pub mod signals;
pub mod types;
pub mod wakeups;

use std::future::Future;
use std::pin::Pin;

use clap::Parser;
use futures::Stream;

pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T>>>;
pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T>>>;

/// A power device-model daemon: discovers batteries, line power, UPSes and
/// power meters, maintains their electrical state, and exposes system power
/// properties and per-battery history over D-Bus.
#[derive(Debug, Parser)]
#[clap(author, about, version = env!("VERSION"))]
pub struct CliArgs {
    /// Sets a TOML config file
    #[clap(default_value = "/etc/powerkitd/config.toml")]
    pub config: String,
    /// Override the configured platform backend
    #[clap(long = "backend")]
    pub backend: Option<String>,
    /// Run without claiming the well-known bus name (for development)
    #[clap(long = "no-bus")]
    pub no_bus: bool,
}
