//! A small API behind the warden gateway.
//!
//! Run with:
//!   RUST_LOG=info,warden=debug cargo run --example gateway
//!   WARDEN_CONFIG=warden.toml WARDEN_ACCESS_LOG_PATH=/tmp/access.jsonl cargo run --example gateway
//!
//! Try:
//!   curl -i http://localhost:8000/orders/42                      # x-ratelimit-* headers
//!   for i in $(seq 12); do curl -s -o /dev/null -w '%{http_code}\n' localhost:8000/orders/1; done
//!   curl -i -H 'authorization: Bearer alice' http://localhost:8000/me
//!   curl -i http://localhost:8000/boom                           # 500, still logged
//!   curl http://localhost:8000/health                            # exempt, never limited

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use warden::access_log::{JsonLinesSink, LogPipeline, LogSink, MemorySink};
use warden::limiter::{AdmissionController, MemoryCounterStore};
use warden::{Gateway, GatewayConfig, Request, Response, Router, Server, context, health};

#[tokio::main]
async fn main() -> Result<(), warden::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("WARDEN_CONFIG") {
        Ok(path) => GatewayConfig::from_file(path)?,
        Err(_) => GatewayConfig::default(),
    }
    .with_env("WARDEN")?;

    let sink: Arc<dyn LogSink> = match &config.access_log.path {
        Some(path) => Arc::new(JsonLinesSink::new(path)),
        None => Arc::new(MemorySink::new()),
    };

    let limiter = AdmissionController::new(Arc::new(MemoryCounterStore::new()), config.rate_limit.clone());
    let (log, drainer) = LogPipeline::new(&config.access_log, sink);
    let gateway = Gateway::new(limiter, log)
        .trust_proxy_headers(config.trust_proxy_headers)
        .with_subject_resolver(|req| {
            req.header("authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .filter(|token| !token.is_empty())
                .map(str::to_owned)
        });

    let app = Router::new()
        .get("/health", health::status)
        .get("/healthz", health::liveness)
        .get("/readyz", health::readiness)
        .get("/orders/{id}", get_order)
        .get("/me", whoami)
        .get("/boom", boom);

    Server::bind(&config.listen)?
        .shutdown_grace(config.shutdown_grace())
        .serve(app, gateway, drainer)
        .await
}

// GET /orders/{id}
async fn get_order(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","status":"shipped"}}"#))
}

// GET /me: answered from the request context.
async fn whoami(_req: Request) -> Response {
    let body = context::with_current(|ctx| match ctx {
        Some(ctx) => serde_json::json!({
            "request_id": ctx.request_id(),
            "client": ctx.client_addr(),
            "subject": ctx.subject(),
        }),
        None => serde_json::json!({}),
    });
    Response::json(body.to_string())
}

// GET /boom
async fn boom(_req: Request) -> Response {
    panic!("simulated handler failure");
}
