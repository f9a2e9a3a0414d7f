use axum::extract::MatchedPath;
use axum::{Router, routing::get};
use futures_util::future::BoxFuture;
use http::{Request, StatusCode};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::{Layer, Service};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Spawns the `/healthz`, `/readyz`, `/metrics` surface the supervisor
/// exposes alongside the WebSocket endpoint. This is ambient observability,
/// not part of the fan-in/fan-out pipeline itself.
pub fn spawn_metrics_server(port: u16, ready: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    let handle = install_recorder_once().clone();
    tokio::spawn(run_metrics_server(port, handle, ready));
}

async fn run_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    let metrics_route = axum::routing::get(move || {
        let handle = handle.clone();
        async move { handle.render() }
    });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(std::sync::atomic::Ordering::Relaxed) {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                    }
                }
            }),
        )
        .route("/metrics", metrics_route)
        .layer(MetricsLayer::new());

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("failed to bind metrics server to {addr}: {e}").red());
            return;
        }
    };
    println!("{} {}", "metrics server listening on".green(), addr.green());
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .expect("serve metrics");
    println!(
        "{} {}",
        "metrics server stopped, uptime".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

/// Resolves once SIGINT or SIGTERM is received (or Ctrl+C on non-Unix).
/// The metrics server listens for the signal itself rather than being
/// wired to the pipeline's own `CancellationToken`, so it keeps serving
/// `/metrics` for as long as the process is up, independent of pipeline
/// shutdown ordering.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}

/// Records request count, latency histogram, and in-flight gauge, keyed by
/// matched route rather than raw URL to avoid high-cardinality labels.
#[derive(Clone)]
pub struct MetricsLayer {
    classifier: SharedClassifier<ServerErrorsAsFailures>,
}

impl MetricsLayer {
    pub fn new() -> Self {
        Self {
            classifier: SharedClassifier::new(ServerErrorsAsFailures::new()),
        }
    }
}

impl Default for MetricsLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            classifier: self.classifier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    pub classifier: SharedClassifier<ServerErrorsAsFailures>,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let start = Instant::now();
        let method_str = req.method().as_str().to_owned();
        let route: String = req
            .extensions()
            .get::<MatchedPath>()
            .map(|m| m.as_str().to_owned())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let mut svc = self.inner.clone();
        let fut = svc.call(req);

        Box::pin(async move {
            let in_flight = gauge!("http_server_in_flight_requests", "method" => method_str.clone());
            in_flight.increment(1);

            let res = fut.await;
            let elapsed = start.elapsed().as_secs_f64();
            let status = match &res {
                Ok(resp) => resp.status(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };

            histogram!(
                "http_server_request_duration_seconds",
                "method" => method_str.clone(),
                "route" => route.clone(),
                "status" => status.as_u16().to_string()
            )
            .record(elapsed);

            counter!(
                "http_server_requests_total",
                "method" => method_str,
                "route" => route,
                "status" => status.as_u16().to_string()
            )
            .increment(1);

            in_flight.decrement(1);
            res
        })
    }
}
