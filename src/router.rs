//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. The router only finds
//! handlers. Admission, context and access logging belong to the
//! [`Gateway`](crate::Gateway) wrapped around it.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::context;
use crate::handler::{Endpoint, Handler};
use crate::request::Request;
use crate::response::Response;

/// The application router. Build it once at startup.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Arc<Endpoint>>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them.
    ///
    /// # Panics
    ///
    /// Panics if `path` is malformed or conflicts with an existing route.
    /// Routes are registered at startup, so this is a programming error.
    pub fn route(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, Arc::new(handler.into_endpoint(path)))
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.route(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.route(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.route(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.route(Method::DELETE, path, handler)
    }

    /// Routes one request. Unknown paths get `404 Not Found`.
    pub async fn dispatch(&self, mut req: Request) -> Response {
        match self.lookup(req.method(), req.path()) {
            Some((endpoint, params)) => {
                context::with_current(|ctx| {
                    debug!(
                        request_id = ctx.map(|c| c.request_id()),
                        route = endpoint.pattern(),
                        "dispatching"
                    );
                });
                req.set_params(params);
                endpoint.call(req).await
            }
            None => Response::status(StatusCode::NOT_FOUND),
        }
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(Arc<Endpoint>, HashMap<String, String>)> {
        let matched = self.routes.get(method)?.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn get(path: &str) -> Request {
        http::Request::get(path).body(Bytes::new()).unwrap().into()
    }

    async fn show(req: Request) -> String {
        format!("order {}", req.param("id").unwrap_or("?"))
    }

    #[tokio::test]
    async fn dispatches_with_params() {
        let router = Router::new().get("/orders/{id}", show);
        let res = router.dispatch(get("/orders/17")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body(), b"order 17");
    }

    #[tokio::test]
    async fn unknown_route_or_method_is_404() {
        let router = Router::new().get("/orders/{id}", show);
        assert_eq!(router.dispatch(get("/customers")).await.status_code(), StatusCode::NOT_FOUND);

        let post = http::Request::post("/orders/1").body(Bytes::new()).unwrap().into();
        assert_eq!(router.dispatch(post).await.status_code(), StatusCode::NOT_FOUND);
    }
}
