use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use patchd_core::manifest::ManifestOptions;
use patchd_core::ratelimit::RateLimiter;
use patchd_core::service::DistributionService;

use crate::auth::{Authorizer, OpenAuthorizer, StaticTokenAuthorizer};
use crate::config::ServerConfig;
use crate::http::{self, AppState};

pub fn authorizer(cfg: &ServerConfig) -> Arc<dyn Authorizer> {
    if cfg.api_tokens.is_empty() && cfg.admin_token.is_none() {
        warn!("no API tokens configured: every client is admitted as anonymous, patch creation is disabled");
        Arc::new(OpenAuthorizer)
    } else {
        Arc::new(StaticTokenAuthorizer::new(cfg.api_tokens.clone(), cfg.admin_token.clone()))
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let root = cfg.files_dir.clone();
    let options = ManifestOptions { exclude: cfg.exclude.clone() };
    // a missing or unreadable root is fatal here, before anything listens
    let service = tokio::task::spawn_blocking(move || DistributionService::open(root, options))
        .await
        .context("manifest task")??;
    let m = service.manifest();
    info!(version = %m.version, files = m.files.len(), root = %cfg.files_dir.display(), "manifest loaded");

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(RateLimiter::with_system_clock(cfg.rate.clone()));
    let sweeper = Arc::clone(&limiter).spawn_sweeper(shutdown.child_token());

    let state = AppState::new(Arc::new(service), limiter, authorizer(&cfg))
        .with_allowed_origins(cfg.allowed_origins.clone());
    info!(origins = ?cfg.allowed_origins, "CORS origins");
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!(addr = %cfg.bind, "patchd listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        res = &mut server => {
            res.context("server task")?.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutting down");
            shutdown.cancel();
            match tokio::time::timeout(cfg.shutdown_timeout, &mut server).await {
                Ok(res) => res.context("server task")?.context("server error")?,
                Err(_) => {
                    warn!(timeout_secs = cfg.shutdown_timeout.as_secs(), "graceful shutdown timed out, dropping connections");
                    server.abort();
                }
            }
        }
    }

    shutdown.cancel();
    let _ = sweeper.await;
    info!("server exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
