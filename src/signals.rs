use std::io;

use tracing::info;

/// Resolve once the process is asked to stop, naming the signal received.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = hangup.recv() => "hangup",
        _ = interrupt.recv() => "interrupt",
        _ = quit.recv() => "quit",
        _ = terminate.recv() => "terminate",
    };
    info!(signal = received, "shutdown requested");

    Ok(received)
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl_c", "shutdown requested");

    Ok("ctrl_c")
}
