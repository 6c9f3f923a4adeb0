//! HTTP backend: binds each configured endpoint to its own listener,
//! pinned to HTTP/1.1 or HTTP/2 per `EndpointConfig::protocol`, and serves
//! the router built in [`router`].
//!
//! M1 and M5 are independently-addressed, independently-versioned
//! endpoints (M1 over HTTP/2 by default, M5 over HTTP/1.1), so `serve_all`
//! spawns one accept loop per endpoint and picks the matching
//! `hyper::server::conn` builder instead of auto-negotiating.

pub mod router;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::config::{Config, EndpointConfig, HttpProtocol};
use crate::engine::EngineHandle;

/// Binds and serves every configured endpoint; returns once all of their
/// accept loops have ended (normally only on a bind error, since a healthy
/// loop runs forever).
pub async fn serve_all(engine: EngineHandle, config: Config) -> Result<()> {
    let mut tasks = Vec::new();
    for endpoint in config.endpoints.clone() {
        let engine = engine.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(
            async move { serve_endpoint(engine, &config, &endpoint).await },
        ));
    }
    for task in tasks {
        task.await.context("endpoint task panicked")??;
    }
    Ok(())
}

async fn serve_endpoint(engine: EngineHandle, config: &Config, endpoint: &EndpointConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", endpoint.address, endpoint.port)
        .parse()
        .with_context(|| format!("invalid bind address for endpoint {}", endpoint.name))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding endpoint {} to {addr}", endpoint.name))?;
    info!(endpoint = %endpoint.name, %addr, protocol = ?endpoint.protocol, "listening");

    // Watchdog: a request that doesn't get a reply within the outbound
    // timeout window is failed with 503.
    let app = router::build_router(engine, config).layer(
        ServiceBuilder::new()
            .layer(CorsLayer::permissive())
            .layer(tower::util::MapResponseLayer::new(|mut res: axum::response::Response| {
                if res.status() == StatusCode::REQUEST_TIMEOUT {
                    *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                }
                res
            }))
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.outbound_timeout_seconds,
            ))),
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(endpoint = %endpoint.name, error = %e, "accept failed");
                continue;
            }
        };
        let io = hyper_util::rt::TokioIo::new(stream);
        let service = app.clone();
        let protocol = endpoint.protocol;
        let endpoint_name = endpoint.name.clone();

        tokio::spawn(async move {
            let hyper_service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let mut service = service.clone();
                let req = req.map(axum::body::Body::new);
                async move { Ok::<_, Infallible>(tower::Service::call(&mut service, req).await.expect("router service is infallible")) }
            });

            let result = match protocol {
                HttpProtocol::Http1 => {
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, hyper_service)
                        .with_upgrades()
                        .await
                }
                HttpProtocol::Http2 => {
                    hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(io, hyper_service)
                        .await
                }
            };
            if let Err(e) = result {
                warn!(endpoint = %endpoint_name, %peer, error = %e, "connection error");
            }
        });
    }
}
