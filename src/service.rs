//! Process plumbing shared by the service binaries.

use crate::runtime::{Bus, Error, StopToken};
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Trigger `stop` on SIGINT or SIGTERM.
///
/// The signals are awaited on a dedicated thread running a current-thread
/// tokio runtime, so the reactor thread only ever sees the token.
pub fn spawn_signal_listener(stop: StopToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || runtime.block_on(stop_on(stop, shutdown_signal())))?;
    Ok(())
}

async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

async fn stop_on<F>(stop: StopToken, signal: F)
where
    F: Future<Output = io::Result<&'static str>>,
{
    match signal.await {
        Ok(name) => {
            info!(signal = name, "shutdown requested");
            stop.stop();
        }
        Err(e) => error!(error = %e, "failed to install signal handler"),
    }
}

/// Error callback handed to the run loop: log and carry on.
pub fn report_error(_bus: &Rc<Bus>, err: &Error) {
    error!(fd = err.fd(), errno = err.errno(), "{}", err);
}
