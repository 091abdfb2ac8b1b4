use futures::stream::StreamExt as _;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;

use crate::BoxedStream;
use crate::errors::*;

/// A stream that yields once per termination request. The daemon flushes
/// history and disarms timer stats before exiting.
pub fn shutdown_stream() -> Result<BoxedStream<()>> {
    let signals = Signals::new([SIGTERM, SIGINT]).error("failed to install signal handlers")?;
    Ok(signals.map(|_| ()).boxed_local())
}
