//! Prometheus metrics for the forwarder.
//!
//! All metrics use the default Prometheus registry. Per-input series are
//! labelled with the input path.

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ==================== THROUGHPUT ====================
    pub static ref LINES_READ: IntCounterVec = register_int_counter_vec!(
        "sentlog_lines_read_total",
        "Lines read from each input",
        &["input"]
    )
    .unwrap();
    pub static ref LINES_MATCHED: IntCounterVec = register_int_counter_vec!(
        "sentlog_lines_matched_total",
        "Lines that matched one of the input's patterns",
        &["input"]
    )
    .unwrap();
    pub static ref EVENTS_REPORTED: IntCounterVec = register_int_counter_vec!(
        "sentlog_events_reported_total",
        "Events submitted to the reporting client",
        &["input"]
    )
    .unwrap();

    // ==================== LIFECYCLE ====================
    pub static ref FILE_ROTATIONS: IntCounterVec = register_int_counter_vec!(
        "sentlog_file_rotations_total",
        "Rotations and truncations detected per input",
        &["input"]
    )
    .unwrap();
    pub static ref WORKER_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sentlog_worker_failures_total",
        "Input workers that stopped with an error",
        &["input"]
    )
    .unwrap();
    pub static ref GENERATIONS: IntCounter = register_int_counter!(
        "sentlog_generations_total",
        "Worker generations started (1 + reloads)"
    )
    .unwrap();
    pub static ref ACTIVE_WORKERS: IntGauge = register_int_gauge!(
        "sentlog_active_workers",
        "Input workers currently running"
    )
    .unwrap();

    // ==================== LATENCY ====================
    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "sentlog_flush_duration_seconds",
        "Time spent flushing a reporting session",
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();
}

/// Holds one increment of a gauge, released on drop so aborted tasks still
/// give it back.
pub struct GaugeGuard {
    gauge: IntGauge,
}

impl GaugeGuard {
    pub fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Text exposition of the default registry.
pub fn render() -> Result<Vec<u8>> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Serves `GET /metrics` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;
    info!(%addr, "metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, hyper::Error>(respond(req.uri().path()))
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
    Ok(())
}

fn respond(path: &str) -> Response<Full<Bytes>> {
    let (status, content_type, body) = if path != "/metrics" {
        (StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found"))
    } else {
        match render() {
            Ok(buffer) => (
                StatusCode::OK,
                prometheus::TEXT_FORMAT,
                Bytes::from(buffer),
            ),
            Err(err) => {
                warn!(error = %err, "failed to render metrics");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from_static(b"metrics unavailable"),
                )
            }
        }
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
