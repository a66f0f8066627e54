//! Built-in health-check handlers.
//!
//! | Path | Question |
//! |---|---|
//! | `/health` | Is the gateway up, and which service is it? |
//! | `/healthz` | Liveness: can the process answer HTTP at all? |
//! | `/readyz` | Readiness: should the pod receive traffic? |
//!
//! All three are in the default exempt list of
//! [`RateLimitConfig`](crate::limiter::RateLimitConfig): probes never spend
//! quota and never reach the access log.

use serde::Serialize;

use crate::{Request, Response};

#[derive(Serialize)]
struct Status<'a> {
    status: &'a str,
    service: &'a str,
    version: &'a str,
}

/// `200 OK` with `{"status":"active","service":"warden","version":...}`.
pub async fn status(_req: Request) -> Response {
    let body = Status {
        status: "active",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    };
    match serde_json::to_vec(&body) {
        Ok(bytes) => Response::json(bytes),
        Err(_) => Response::text("active"),
    }
}

/// Liveness probe. Always `200 OK` with body `"ok"`.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// Readiness probe (default implementation). Replace it if the service must
/// warm up or check its dependencies before taking traffic.
pub async fn readiness(_req: Request) -> Response {
    Response::text("ready")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn status_reports_service() {
        let req: Request = http::Request::get("/health").body(Bytes::new()).unwrap().into();
        let res = status(req).await;
        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["service"], "warden");
    }
}
