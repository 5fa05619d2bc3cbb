use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Every long-running loop watches this token and drains
/// gracefully; in-flight transactions roll back and leased work is
/// reclaimed by lease expiry.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::error!(error = %error, "failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
                _ = ctrl_c => {
                    tracing::info!("received interrupt, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received interrupt, initiating graceful shutdown");
        }

        token_clone.cancel();
    });

    token
}
