//! Maps OS signals onto supervisor [`Control`] requests: SIGINT and SIGTERM
//! request a shutdown, SIGHUP a reload.

use super::Control;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Installs the handlers before returning, so a signal delivered right after
/// startup is never lost. The task ends once the supervisor drops its receiver.
#[cfg(unix)]
pub fn listen(tx: mpsc::Sender<Control>) -> Result<JoinHandle<()>> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sig_term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sig_hup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = sig_int.recv() => {
                    info!(signal = "SIGINT", "shutdown signal received");
                    Control::Shutdown
                }
                _ = sig_term.recv() => {
                    info!(signal = "SIGTERM", "shutdown signal received");
                    Control::Shutdown
                }
                _ = sig_hup.recv() => {
                    info!(signal = "SIGHUP", "reload signal received");
                    Control::Reload
                }
            };
            if tx.send(request).await.is_err() {
                debug!("supervisor gone; signal listener exiting");
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn listen(tx: mpsc::Sender<Control>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            if tx.send(Control::Shutdown).await.is_err() {
                debug!("supervisor gone; signal listener exiting");
                break;
            }
        }
    }))
}
