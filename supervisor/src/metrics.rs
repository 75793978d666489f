//! Prometheus metrics
//!
//! Counters for the externally observable activity of the supervisor,
//! served on a plain HTTP endpoint when enabled.

use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct Metrics {
    registry: Registry,
    pub commands_total: IntCounter,
    pub command_failures_total: IntCounter,
    pub radius_requests_total: IntCounter,
    pub radius_rejects_total: IntCounter,
    pub ap_events_total: IntCounter,
    pub capture_spawns_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let commands_total = IntCounter::new(
            "edgesec_commands_total",
            "Operator commands processed",
        )?;
        let command_failures_total = IntCounter::new(
            "edgesec_command_failures_total",
            "Operator commands answered with FAIL",
        )?;
        let radius_requests_total = IntCounter::new(
            "edgesec_radius_requests_total",
            "RADIUS Access-Requests received",
        )?;
        let radius_rejects_total = IntCounter::new(
            "edgesec_radius_rejects_total",
            "RADIUS Access-Rejects sent",
        )?;
        let ap_events_total = IntCounter::new(
            "edgesec_ap_events_total",
            "AP station events observed",
        )?;
        let capture_spawns_total = IntCounter::new(
            "edgesec_capture_spawns_total",
            "Capture workers spawned",
        )?;

        for counter in [
            &commands_total,
            &command_failures_total,
            &radius_requests_total,
            &radius_rejects_total,
            &ap_events_total,
            &capture_spawns_total,
        ] {
            registry.register(Box::new(counter.clone()))?;
        }

        Ok(Arc::new(Self {
            registry,
            commands_total,
            command_failures_total,
            radius_requests_total,
            radius_rejects_total,
            ap_events_total,
            capture_spawns_total,
        }))
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Serve `GET <path>` until shutdown.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    path: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics endpoint on port {} at {}", port, path);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Metrics endpoint shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Metrics accept error: {}", e);
                        continue;
                    }
                };
                let metrics = Arc::clone(&metrics);
                let path = path.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let metrics = Arc::clone(&metrics);
                        let path = path.clone();
                        async move {
                            let response = if req.uri().path() == path {
                                Response::new(Full::new(Bytes::from(metrics.render())))
                            } else {
                                Response::builder()
                                    .status(StatusCode::NOT_FOUND)
                                    .body(Full::new(Bytes::from("not found")))
                                    .unwrap()
                            };
                            Ok::<_, std::convert::Infallible>(response)
                        }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!("Metrics connection error: {}", e);
                    }
                });
            }
        }
    }
    Ok(())
}
