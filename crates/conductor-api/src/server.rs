//! Listener setup and graceful-drain lifecycle.
//!
//! On shutdown signal:
//! 1. the admission flag flips (new submissions get 503 + Retry-After),
//! 2. listeners stop accepting new connections,
//! 3. the scheduler and elector stop,
//! 4. active runs get `drain_timeout` to finish (warn and proceed on
//!    expiry),
//! 5. open HTTP connections get `shutdown_timeout`,
//! 6. the socket file and PID file are removed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use conductor_core::leader::LeaderElector;
use conductor_core::scheduler::Scheduler;
use conductor_infra::backend::AnyBackend;
use conductor_infra::pidfile::PidFile;
use tokio_util::sync::CancellationToken;

use crate::http::auth::PeerKind;
use crate::http::router::build_router;
use crate::state::AppState;

/// Default TCP bind when no listener is configured.
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:7310";

/// Run the service until a shutdown signal, then drain.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let config = Arc::clone(&state.config);

    let _pid_file = config
        .server
        .pid_file
        .as_ref()
        .map(|path| PidFile::create(path))
        .transpose()?;

    // Trigger plane: scheduler, leader-gated in distributed mode.
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&state.runner),
        Arc::clone(&state.backend),
        Arc::clone(&state.loader),
        config.schedules.clone(),
    )?);

    let elector: Option<Arc<LeaderElector<AnyBackend>>> = if config.distributed {
        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&state.backend),
            state.instance_id.clone(),
        ));
        let (leadership_tx, mut leadership_rx) = tokio::sync::watch::channel(false);
        elector.on_leadership_change(move |leader| {
            let _ = leadership_tx.send(leader);
        });
        // Bridge the synchronous callback onto the scheduler's async
        // start/stop.
        let gated = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while leadership_rx.changed().await.is_ok() {
                let leader = *leadership_rx.borrow();
                if leader {
                    gated.start().await;
                } else {
                    gated.stop().await;
                }
            }
        });
        elector.start().await;
        Some(elector)
    } else {
        scheduler.start().await;
        None
    };

    // Listeners.
    let router = build_router(state.clone());
    let shutdown = CancellationToken::new();
    let mut server_tasks = Vec::new();

    // Idle rate-limit buckets are swept periodically.
    let bucket_max_age = Duration::from_secs(config.limits.bucket_max_age_secs);
    let sweep_interval = Duration::from_secs(60);
    let _request_sweeper = Arc::clone(&state.request_limits).spawn_sweeper(
        sweep_interval,
        bucket_max_age,
        shutdown.clone(),
    );
    let _endpoint_sweeper = Arc::clone(&state.endpoint_limits).spawn_sweeper(
        sweep_interval,
        bucket_max_age,
        shutdown.clone(),
    );

    let tcp_addr = config
        .listener
        .tcp_addr
        .clone()
        .or_else(|| config.listener.socket.is_none().then(|| DEFAULT_TCP_ADDR.to_string()));
    if let Some(addr) = &tcp_addr {
        if config.listener.tls_cert.is_some() || config.listener.tls_key.is_some() {
            tracing::warn!(
                "in-process TLS termination is not supported; front the TCP listener with a TLS proxy"
            );
        }
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = addr.as_str(), "TCP listener bound");
        let app = router.clone().layer(Extension(PeerKind::Tcp));
        let token = shutdown.clone();
        server_tasks.push(tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        }));
    }

    let socket_path = config.listener.socket.clone();
    if let Some(path) = &socket_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Stale socket from an unclean shutdown.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "local socket bound");
        let app = router.clone().layer(Extension(PeerKind::Local));
        let token = shutdown.clone();
        server_tasks.push(tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        }));
    }

    if server_tasks.is_empty() {
        anyhow::bail!("no listeners configured");
    }

    println!(
        "  {} conductord listening{}",
        console::style("⚡").bold(),
        tcp_addr
            .as_deref()
            .map(|a| format!(" on http://{a}"))
            .unwrap_or_default()
    );
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    // 1. Refuse new submissions.
    state.runner.start_draining();
    // 2. Refuse new connections; keep-alives wind down.
    shutdown.cancel();
    // 3. Stop the trigger plane.
    scheduler.stop().await;
    if let Some(elector) = &elector {
        elector.stop().await;
    }
    // 4. Let in-flight runs finish.
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    if let Err(e) = state.runner.wait_for_drain(drain_timeout).await {
        tracing::warn!(error = %e, "drain timeout expired, proceeding with shutdown");
    }
    state.runner.shutdown();

    // 5. Bound the HTTP wind-down.
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    for task in server_tasks {
        match tokio::time::timeout(shutdown_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "server error during shutdown"),
            Ok(Err(e)) => tracing::warn!(error = %e, "server task panicked"),
            Err(_) => tracing::warn!("HTTP shutdown timeout expired"),
        }
    }

    // 6. Release the socket; the PID file is removed on drop.
    if let Some(path) = &socket_path {
        let _ = std::fs::remove_file(path);
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
