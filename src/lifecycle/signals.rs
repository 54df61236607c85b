//! OS signal handling.
//!
//! SIGINT/SIGTERM (Ctrl-C on every platform) end the process gracefully.
//! SIGHUP asks for a configuration reload.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}

/// Forward process signals onto a channel until the receiver is dropped.
pub fn spawn_signal_listener() -> mpsc::UnboundedReceiver<Signal> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let signal = next_signal().await;
            tracing::info!(signal = ?signal, "Signal received");
            if tx.send(signal).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(unix)]
async fn next_signal() -> Signal {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        signal = ctrl_c() => signal,
        _ = term.recv() => Signal::Shutdown,
        _ = hup.recv() => Signal::Reload,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Signal {
    ctrl_c().await
}

async fn ctrl_c() -> Signal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    Signal::Shutdown
}
