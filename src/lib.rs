//! Veritas -- test-management portal core.
//!
//! This crate provides tiered configuration resolution, cache-aside
//! collections over a relational store, the test-execution lifecycle, and
//! durable artifact storage, plus the HTTP surface that exposes them.

pub mod api;
pub mod artifacts;
pub mod cache;
pub mod catalog;
pub mod error;
pub mod health;
pub mod kv;
pub mod lifecycle;
pub mod logging;
pub mod notify;
pub mod objects;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod storage;

use anyhow::{Context, Result};

use crate::service::Services;
use crate::settings::Settings;

/// Start the Veritas API server.
pub async fn serve(settings: &Settings, bind: &str) -> Result<()> {
    // 1. Stores and engines (blocking: opens the pool, may dial the cache)
    let owned = settings.clone();
    let (services, report) = tokio::task::spawn_blocking(move || {
        let services = Services::build(&owned)?;
        let report = services.health();
        Ok::<_, anyhow::Error>((services, report))
    })
    .await
    .context("service bootstrap panicked")??;

    if !report.is_healthy() {
        tracing::warn!(status = report.status, "starting with degraded stores");
    }

    // 2. API server
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;
    let app = api::router(api::state::AppState::new(services));

    tracing::info!(%addr, "Veritas listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
