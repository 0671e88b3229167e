use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header::CONTENT_TYPE};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;

const NAMESPACE: &str = "nodeforge";

/// Per-controller instruments, registered in the process-wide default
/// registry so the scrape endpoint can gather them all.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciles by pool and outcome (ok / error / requeue).
    pub reconcile_counter: IntCounterVec,
    /// Read-phase duration per pool.
    pub read_histogram: HistogramVec,
    /// Write-phase duration per pool.
    pub write_histogram: HistogramVec,
    /// Wall-clock drain time per pool, observed at uncordon.
    pub drain_duration_histogram: HistogramVec,
    /// Drains that exceeded their timeout.
    pub drain_stuck_counter: IntCounterVec,
    pub overlap_nodes_gauge: IntGaugeVec,
    pub cordoned_nodes_gauge: IntGaugeVec,
    pub draining_nodes_gauge: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(NAMESPACE)
                .subsystem(subsystem)
        };
        let hist_opts = |name: &str, help: &str| {
            HistogramOpts::new(name, help)
                .namespace(NAMESPACE)
                .subsystem(subsystem)
        };
        let metrics = Self {
            reconcile_counter: register_vec(IntCounterVec::new(
                opts("reconcile_total", "Reconciles by pool and result"),
                &["pool", "result"],
            )),
            read_histogram: register_hist(HistogramVec::new(
                hist_opts("read_phase_seconds", "Read phase duration"),
                &["pool"],
            )),
            write_histogram: register_hist(HistogramVec::new(
                hist_opts("write_phase_seconds", "Write phase duration"),
                &["pool"],
            )),
            drain_duration_histogram: register_hist(HistogramVec::new(
                hist_opts("drain_duration_seconds", "Node drain duration").buckets(vec![
                    1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0,
                ]),
                &["pool"],
            )),
            drain_stuck_counter: register_vec(IntCounterVec::new(
                opts("drain_stuck_total", "Drains that exceeded their timeout"),
                &["pool"],
            )),
            overlap_nodes_gauge: register_gauge(IntGaugeVec::new(
                opts("overlap_nodes", "Nodes matched by more than one pool"),
                &["pool"],
            )),
            cordoned_nodes_gauge: register_gauge(IntGaugeVec::new(
                opts("cordoned_nodes", "Nodes currently cordoned"),
                &["pool"],
            )),
            draining_nodes_gauge: register_gauge(IntGaugeVec::new(
                opts("draining_nodes", "Nodes currently draining"),
                &["pool"],
            )),
        };
        metrics
    }

    /// Drops every per-pool series once the pool is gone so stale gauges do
    /// not linger at their last value.
    pub fn reset_pool(&self, pool: &str) {
        for gauge in [
            &self.overlap_nodes_gauge,
            &self.cordoned_nodes_gauge,
            &self.draining_nodes_gauge,
        ] {
            let _ = gauge.remove_label_values(&[pool]);
        }
        let _ = self.drain_stuck_counter.remove_label_values(&[pool]);
        let _ = self.drain_duration_histogram.remove_label_values(&[pool]);
        let _ = self.read_histogram.remove_label_values(&[pool]);
        let _ = self.write_histogram.remove_label_values(&[pool]);
        for result in ["ok", "error", "requeue"] {
            let _ = self.reconcile_counter.remove_label_values(&[pool, result]);
        }
    }
}

fn register_vec(metric: prometheus::Result<IntCounterVec>) -> IntCounterVec {
    let metric = metric.expect("build metric");
    prometheus::default_registry()
        .register(Box::new(metric.clone()))
        .expect("register metric");
    metric
}

fn register_gauge(metric: prometheus::Result<IntGaugeVec>) -> IntGaugeVec {
    let metric = metric.expect("build metric");
    prometheus::default_registry()
        .register(Box::new(metric.clone()))
        .expect("register metric");
    metric
}

fn register_hist(metric: prometheus::Result<HistogramVec>) -> HistogramVec {
    let metric = metric.expect("build metric");
    prometheus::default_registry()
        .register(Box::new(metric.clone()))
        .expect("register metric");
    metric
}

/// Starts the scrape endpoint when METRICS_PORT is set; otherwise a no-op.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    // Panics on any thread should restart the container rather than leave a
    // half-alive process behind the scrape endpoint.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    tokio::spawn(run_metrics_server(port));
}

pub async fn run_metrics_server(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        tokio::select! {
            _ = nodeforge_common::shutdown::shutdown_signal() => {
                println!("{}", "🛑 Metrics server stopped gracefully".red());
                break;
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(handle))
                        .await
                    {
                        eprintln!("metrics connection error: {e}");
                    }
                });
            }
        }
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buf = Vec::new();
            let encoder = TextEncoder::new();
            encoder
                .encode(&prometheus::gather(), &mut buf)
                .unwrap_or_default();
            Response::builder()
                .header(CONTENT_TYPE, encoder.format_type())
                .body(Full::new(Bytes::from(buf)))
                .unwrap()
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    };
    Ok(response)
}
