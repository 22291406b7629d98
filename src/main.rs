//! Cloud LB Operator
//!
//! Process bootstrap: arguments, logging, health and metrics endpoints and
//! the security group collector timer. Reconciliation itself is driven by
//! the controller runtime through [`LoadBalancerController`].

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud_lb_operator::{
    ControllerConfig, Error, LoadBalancerController, MemoryCloud, Result, StaticDirectory,
    SystemResolver,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cloud LB Operator - Service LoadBalancer reconciliation engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster id written into ownership tags
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: String,

    /// Older cluster ids whose resources are still managed (comma separated)
    #[arg(long, env = "LEGACY_CLUSTER_IDS", value_delimiter = ',')]
    legacy_cluster_ids: Vec<String>,

    /// Security group collector interval in seconds
    #[arg(long, env = "GC_INTERVAL", default_value = "60")]
    gc_interval_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Cloud LB Operator");
    info!("  Version: {}", cloud_lb_operator::VERSION);
    info!("  Cluster: {}", args.cluster_id);
    info!("  GC interval: {}s", args.gc_interval_secs);

    if args.cluster_id.is_empty() {
        return Err(Error::Configuration("cluster id must not be empty".into()));
    }

    let mut config = ControllerConfig::new(args.cluster_id.clone());
    config.legacy_cluster_ids = args.legacy_cluster_ids.clone();
    config.gc_interval = Duration::from_secs(args.gc_interval_secs.max(1));

    // standalone: in-memory cloud, no nodes until the runtime hands them over
    let cloud = Arc::new(MemoryCloud::new());
    let nodes = Arc::new(StaticDirectory::default());
    let controller = LoadBalancerController::new(config, cloud, nodes, Arc::new(SystemResolver));
    info!(clusters = ?controller.config().accepted_clusters(), "Controller initialized");

    let shutdown = CancellationToken::new();

    let gc = controller.garbage_collector();
    let gc_interval = controller.config().gc_interval;
    let gc_token = shutdown.clone();
    let gc_task = tokio::spawn(async move {
        let deleted = prometheus::register_int_counter!(
            "cloud_lb_gc_deleted_total",
            "Security groups deleted by the collector"
        )
        .ok();
        let failed = prometheus::register_int_counter!(
            "cloud_lb_gc_failed_total",
            "Security group deletions that failed"
        )
        .ok();
        gc.run(gc_interval, gc_token, |report| {
            if let Some(c) = &deleted {
                c.inc_by(report.deleted.len() as u64);
            }
            if let Some(c) = &failed {
                c.inc_by(report.failed.len() as u64);
            }
        })
        .await
    });

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    if let Err(e) = gc_task.await {
        error!("Collector task failed: {}", e);
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = text_response(StatusCode::OK, buffer);
                            if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
