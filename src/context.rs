//! Per-request context carrier.
//!
//! Every request that passes through the [`Gateway`](crate::Gateway) runs
//! inside a [`scope`] that installs its [`RequestContext`] in a tokio
//! task-local slot. Any code awaited within that request can call
//! [`current`] without the context being threaded through its arguments.
//!
//! ```rust
//! use warden::context::{self, RequestContext};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ctx = RequestContext::new("10.0.0.7", http::Method::GET, "/orders");
//! let id = ctx.request_id().to_owned();
//!
//! context::scope(ctx, async move {
//!     assert_eq!(context::current().unwrap().request_id(), id);
//! })
//! .await;
//!
//! assert!(context::current().is_none());
//! # }
//! ```
//!
//! The slot is released when the scoped future completes, unwinds, or is
//! dropped mid-flight. There is no separate `clear` call to forget.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use http::Method;
use thiserror::Error;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Identifying data for one inbound request.
///
/// Cheap to clone: clones share the same underlying record, so a subject set
/// through one handle is visible through every other.
#[derive(Clone, Debug)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    request_id: String,
    client_addr: String,
    method: Method,
    path: String,
    subject: OnceLock<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("no request context is installed on this task")]
    Missing,

    #[error("authenticated subject already set to `{0}`")]
    SubjectAlreadySet(String),
}

impl RequestContext {
    /// Creates a context with a freshly generated request id.
    pub fn new(client_addr: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self::with_request_id(Uuid::new_v4().to_string(), client_addr, method, path)
    }

    pub fn with_request_id(
        request_id: impl Into<String>,
        client_addr: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id: request_id.into(),
                client_addr: client_addr.into(),
                method,
                path: path.into(),
                subject: OnceLock::new(),
            }),
        }
    }

    pub fn request_id(&self) -> &str { &self.inner.request_id }
    pub fn client_addr(&self) -> &str { &self.inner.client_addr }
    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn path(&self) -> &str { &self.inner.path }

    /// The authenticated subject, if an auth layer has set one.
    pub fn subject(&self) -> Option<&str> {
        self.inner.subject.get().map(String::as_str)
    }

    /// Records the authenticated subject. Succeeds at most once per request.
    pub fn set_subject(&self, subject: impl Into<String>) -> Result<(), ContextError> {
        self.inner
            .subject
            .set(subject.into())
            .map_err(|_| ContextError::SubjectAlreadySet(self.subject().unwrap_or_default().to_owned()))
    }
}

/// Runs `fut` with `ctx` installed as the current request context.
pub async fn scope<F: Future>(ctx: RequestContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// The context of the request executing on this task, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(RequestContext::clone).ok()
}

/// Runs `f` against the current context, or `None` outside a request.
pub fn with_current<R>(f: impl FnOnce(Option<&RequestContext>) -> R) -> R {
    let ctx = current();
    f(ctx.as_ref())
}

/// Sets the authenticated subject on the current request.
pub fn set_subject(subject: impl Into<String>) -> Result<(), ContextError> {
    let ctx = current().ok_or(ContextError::Missing)?;
    ctx.set_subject(subject)
}
