//! Route handlers and how the router stores them.
//!
//! A route table holds handlers of many concrete types, so each one is
//! erased into an [`Endpoint`] when it is registered:
//!
//! ```text
//! async fn orders(req: Request) -> Json { … }        ← user writes this
//!        ↓ router.get("/orders/{id}", orders)
//! Endpoint { pattern: "/orders/{id}", run: Box<dyn Fn> }
//!        ↓ at request time, inside the gateway's context scope
//! (run)(req)  →  Pin<Box<dyn Future<Output = Response>>>
//! ```
//!
//! The endpoint keeps the pattern it was registered under, so dispatch can
//! report which route served a request id.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// The future one endpoint call produces. `Send + 'static` so hyper may
/// drive it on any worker thread.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

type Run = Box<dyn Fn(Request) -> BoxFuture + Send + Sync + 'static>;

/// A registered, type-erased handler.
#[doc(hidden)]
pub struct Endpoint {
    pattern: Box<str>,
    run: Run,
}

impl Endpoint {
    pub(crate) fn call(&self, req: Request) -> BoxFuture {
        (self.run)(req)
    }

    /// The route pattern this endpoint was registered under.
    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("pattern", &self.pattern).finish_non_exhaustive()
    }
}

/// Implemented for every valid route handler: any `async fn(Request)`
/// returning something that implements [`IntoResponse`].
///
/// Sealed. Only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_endpoint(self, pattern: &str) -> Endpoint;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_endpoint(self, pattern: &str) -> Endpoint {
        Endpoint {
            pattern: pattern.into(),
            run: Box::new(move |req| {
                let fut = self(req);
                Box::pin(async move { fut.await.into_response() })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    async fn created(_req: Request) -> StatusCode {
        StatusCode::CREATED
    }

    #[tokio::test]
    async fn endpoint_keeps_pattern_and_converts_output() {
        let endpoint = created.into_endpoint("/orders");
        assert_eq!(endpoint.pattern(), "/orders");

        let req = Request::from(http::Request::post("/orders").body(Bytes::new()).unwrap());
        assert_eq!(endpoint.call(req).await.status_code(), StatusCode::CREATED);
    }
}
