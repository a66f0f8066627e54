//! # warden
//!
//! A request gateway for HTTP APIs. Every request that reaches a handler
//! has passed through one [`Gateway`] that does three things:
//!
//! - **Context**: a [`RequestContext`] (request id, client address, subject,
//!   method, path) is installed in task-local storage for the request's
//!   lifetime. See [`context`].
//! - **Admission**: a token bucket per client, shared through a
//!   [`CounterStore`](limiter::CounterStore), refills continuously and is
//!   spent atomically. Over-budget callers get `429` with
//!   `x-ratelimit-*` headers. See [`limiter`].
//! - **Access logging**: one [`LogRecord`](access_log::LogRecord) per request
//!   goes into a bounded buffer that a background drainer persists in
//!   batches. A full buffer sheds records instead of slowing requests.
//!   See [`access_log`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warden::access_log::{LogPipeline, MemorySink};
//! use warden::limiter::{AdmissionController, MemoryCounterStore};
//! use warden::{Gateway, GatewayConfig, Request, Response, Router, Server, health};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), warden::Error> {
//!     let config = GatewayConfig::default().with_env("WARDEN")?;
//!
//!     let limiter = AdmissionController::new(Arc::new(MemoryCounterStore::new()), config.rate_limit);
//!     let (log, drainer) = LogPipeline::new(&config.access_log, Arc::new(MemorySink::new()));
//!     let gateway = Gateway::new(limiter, log);
//!
//!     let app = Router::new()
//!         .get("/health", health::status)
//!         .get("/orders/{id}", get_order);
//!
//!     Server::bind(&config.listen)?.serve(app, gateway, drainer).await
//! }
//!
//! async fn get_order(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     let who = warden::context::current()
//!         .map(|ctx| ctx.client_addr().to_owned())
//!         .unwrap_or_default();
//!     Response::json(format!(r#"{{"id":"{id}","client":"{who}"}}"#))
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod access_log;
pub mod config;
pub mod context;
pub mod gateway;
pub mod health;
pub mod limiter;

pub use config::GatewayConfig;
pub use context::RequestContext;
pub use error::{ConfigError, Error, SinkError, StoreError};
pub use gateway::{Gateway, HandlerFailure};
pub use handler::Handler;
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
