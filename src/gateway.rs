//! The gateway middleware.
//!
//! [`Gateway::handle`] wraps every inbound request:
//!
//! 1. derive the client address (forwarded headers, else the socket peer);
//! 2. build a [`RequestContext`] and install it for the request's duration;
//! 3. unless the path is exempt, ask the [`AdmissionController`]; a denial
//!    short-circuits with `429` and the handler never runs;
//! 4. run the handler, timing it; a panic becomes a `500`;
//! 5. tag the response with `x-request-id`;
//! 6. submit a [`LogRecord`] for every non-exempt request.
//!
//! Steps 2 and 6 hold on every exit path. The context lives in a task-local
//! scope, and the access record is written by a drop guard, so a handler
//! panic or a client hanging up mid-request still releases the context and
//! still logs (status `499` for the hang-up).

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::header::HeaderValue;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tracing::error;

use crate::access_log::{LogPipeline, LogRecord};
use crate::context::{self, RequestContext};
use crate::limiter::{Admission, AdmissionController, Decision, headers};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// nginx's "client closed request".
const CLIENT_CLOSED_REQUEST: u16 = 499;

const FALLBACK_CLIENT_ADDR: &str = "127.0.0.1";

/// Resolves the authenticated subject of a request before admission runs.
pub type SubjectResolver = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// A handler panicked. The failure has already been logged and counted as a
/// `500`; the server turns it into the client-facing response.
#[derive(Debug, Error)]
#[error("handler panicked while serving request {request_id}: {message}")]
pub struct HandlerFailure {
    pub request_id: String,
    pub message: String,
}

impl IntoResponse for HandlerFailure {
    fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(REQUEST_ID_HEADER, self.request_id)
            .json(r#"{"detail":"Internal Server Error"}"#)
    }
}

/// Per-request orchestration of context, admission and access logging.
#[derive(Clone)]
pub struct Gateway {
    limiter: Arc<AdmissionController>,
    log: LogPipeline,
    resolve_subject: Option<SubjectResolver>,
    trust_proxy_headers: bool,
}

impl Gateway {
    pub fn new(limiter: AdmissionController, log: LogPipeline) -> Self {
        Self {
            limiter: Arc::new(limiter),
            log,
            resolve_subject: None,
            trust_proxy_headers: true,
        }
    }

    /// Installs the hook that identifies authenticated callers.
    pub fn with_subject_resolver(
        mut self,
        resolve: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.resolve_subject = Some(Arc::new(resolve));
        self
    }

    /// Whether `x-forwarded-for` / `x-real-ip` are believed. Turn this off
    /// when clients can reach the gateway without passing a proxy.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn limiter(&self) -> &AdmissionController {
        &self.limiter
    }

    pub fn log(&self) -> &LogPipeline {
        &self.log
    }

    /// Runs `next` for `req` inside the full gateway pipeline.
    pub async fn handle<F, Fut>(&self, req: Request, next: F) -> Result<Response, HandlerFailure>
    where
        F: FnOnce(Request) -> Fut + Send,
        Fut: Future<Output = Response> + Send,
    {
        // Latency includes admission.
        let started = Instant::now();
        let peer = req.remote_addr();
        let client = if self.trust_proxy_headers {
            client_addr(req.headers(), peer)
        } else {
            peer.map_or_else(|| FALLBACK_CLIENT_ADDR.to_owned(), |p| p.ip().to_string())
        };
        let ctx = RequestContext::new(client, req.method().clone(), req.path());

        // Probes and docs get a context and a request id, nothing else.
        let exempt = self.limiter.is_exempt(ctx.path());

        // Everything below runs with `ctx` installed. Leaving this block by
        // any route (return, panic, drop) uninstalls it.
        let outcome = context::scope(ctx.clone(), async {
            if exempt {
                return AssertUnwindSafe(next(req)).catch_unwind().await.map_err(panic_message);
            }

            if let Some(subject) = self.resolve_subject.as_ref().and_then(|resolve| resolve(&req)) {
                // Fresh context: the slot is always empty here.
                let _ = ctx.set_subject(subject);
            }

            // Denials and fail-closed outages answer here; the handler never
            // runs, but the request is still logged.
            let quota = match self.limiter.admit(&ctx).await {
                Admission::Granted(d) => Some(d),
                Admission::Unmetered => None,
                Admission::Rejected(d) => {
                    AccessGuard::new(&self.log, &ctx, started).finish(StatusCode::TOO_MANY_REQUESTS.as_u16());
                    return Ok(too_many_requests(&d));
                }
                Admission::Unavailable => {
                    AccessGuard::new(&self.log, &ctx, started).finish(StatusCode::SERVICE_UNAVAILABLE.as_u16());
                    return Ok(quota_unavailable());
                }
            };

            // From here on the guard owns the access record. If this future
            // is dropped before `finish`, the guard logs a 499.
            let guard = AccessGuard::new(&self.log, &ctx, started);
            match AssertUnwindSafe(next(req)).catch_unwind().await {
                Ok(mut response) => {
                    guard.finish(response.status_code().as_u16());
                    if let Some(d) = quota {
                        set_quota_headers(response.headers_mut(), &d);
                    }
                    Ok(response)
                }
                Err(payload) => {
                    guard.finish(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                    Err(panic_message(payload))
                }
            }
        })
        .await;

        match outcome {
            Ok(mut response) => {
                if let Ok(id) = HeaderValue::from_str(ctx.request_id()) {
                    response.headers_mut().insert(REQUEST_ID_HEADER, id);
                }
                Ok(response)
            }
            Err(message) => {
                error!(
                    request_id = ctx.request_id(),
                    method = %ctx.method(),
                    path = ctx.path(),
                    panic = %message,
                    "handler panicked"
                );
                Err(HandlerFailure { request_id: ctx.request_id().to_owned(), message })
            }
        }
    }
}

// ── Client address ────────────────────────────────────────────────────────────

/// Client address: first `x-forwarded-for` entry, else `x-real-ip`, else the
/// socket peer, else `127.0.0.1`.
pub fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header(FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header(REAL_IP_HEADER))
        .map(str::to_owned)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| FALLBACK_CLIENT_ADDR.to_owned())
}

// ── Access record guard ───────────────────────────────────────────────────────

/// Submits the request's [`LogRecord`] exactly once: explicitly through
/// [`finish`](AccessGuard::finish), or on drop if the request future was
/// abandoned first.
struct AccessGuard<'a> {
    log: &'a LogPipeline,
    ctx: &'a RequestContext,
    started: Instant,
    submitted: bool,
}

impl<'a> AccessGuard<'a> {
    fn new(log: &'a LogPipeline, ctx: &'a RequestContext, started: Instant) -> Self {
        Self { log, ctx, started, submitted: false }
    }

    fn finish(mut self, status: u16) {
        self.submit(status);
    }

    fn submit(&mut self, status: u16) {
        self.submitted = true;
        self.log.submit(LogRecord::new(self.ctx, status, self.started.elapsed()));
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.submit(CLIENT_CLOSED_REQUEST);
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

fn set_quota_headers(map: &mut HeaderMap, d: &Decision) {
    map.insert(headers::LIMIT, HeaderValue::from(d.limit));
    map.insert(headers::REMAINING, HeaderValue::from(d.remaining));
}

fn too_many_requests(d: &Decision) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(headers::RESET, d.reset_at())
        .header(headers::RETRY_AFTER, d.retry_after_secs())
        .json(r#"{"detail":"Too many requests"}"#);
    set_quota_headers(response.headers_mut(), d);
    response
}

fn quota_unavailable() -> Response {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(headers::RETRY_AFTER, 1u64)
        .json(r#"{"detail":"Rate limiting temporarily unavailable"}"#)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map_or_else(|| "non-string panic payload".to_owned(), |s| (*s).to_owned()),
    }
}
