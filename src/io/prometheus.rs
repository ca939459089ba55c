//! Prometheus metrics HTTP endpoint
//!
//! Exposes parking metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use crate::services::store::ParkingStore;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Histogram bucket upper bounds (microseconds), matching the collector
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "parkgate_entries_total",
        "Entry requests that reached Active",
        MetricType::Counter,
        site,
        summary.entries_ok,
    );
    write_metric(
        &mut output,
        "parkgate_entries_rejected_total",
        "Entry requests refused or rolled back",
        MetricType::Counter,
        site,
        summary.entries_rejected,
    );
    write_metric(
        &mut output,
        "parkgate_sessions_completed_total",
        "Sessions that reached Completed",
        MetricType::Counter,
        site,
        summary.completions,
    );
    write_metric(
        &mut output,
        "parkgate_sessions_cancelled_total",
        "Sessions cancelled by operator or sweep",
        MetricType::Counter,
        site,
        summary.cancellations,
    );
    write_metric(
        &mut output,
        "parkgate_spaces_occupied",
        "Active spaces currently occupied",
        MetricType::Gauge,
        site,
        summary.occupied as u64,
    );
    write_metric(
        &mut output,
        "parkgate_spaces_total",
        "Active spaces overall",
        MetricType::Gauge,
        site,
        summary.total_spaces as u64,
    );

    for (name, help, op) in [
        ("parkgate_capture", "Camera capture", &summary.capture),
        ("parkgate_actuation", "Barrier actuation", &summary.actuation),
        ("parkgate_print", "Ticket print", &summary.print),
    ] {
        write_metric(
            &mut output,
            &format!("{name}_failures_total"),
            &format!("{help} operations that surfaced an error"),
            MetricType::Counter,
            site,
            op.failures,
        );
        write_histogram(
            &mut output,
            &format!("{name}_latency_us"),
            &format!("{help} latency in microseconds"),
            site,
            &op.buckets,
            op.avg_latency_us,
        );
    }

    output
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    store: Arc<dyn ParkingStore>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let (occupied, total) = store.occupancy().await.unwrap_or((0, 0));
            let summary = metrics.report(occupied, total);
            let body = format_prometheus_metrics(&summary, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    store: Arc<dyn ParkingStore>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let store = store.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let store = store.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, store, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
