//! HTTP server, graceful shutdown and the background task lifecycle.
//!
//! [`Server::serve`] owns three things for the life of the process:
//!
//! 1. the accept loop, handing each connection to hyper;
//! 2. two background tasks spawned before the first request: the
//!    [`LogDrainer`] and the idle-bucket sweeper;
//! 3. shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`. No new connections are made.
//! 2. Telling every open connection to finish its current request and close.
//!    Idle keep-alive connections close at once.
//! 3. Waiting up to the shutdown grace period (default 5 s) for them, then
//!    aborting whatever is left.
//! 4. Stopping the drainer and waiting for its final flush.
//!
//! Requests finishing during step 2 still submit their access records.
//! The drainer closes its buffer only after the last connection is gone.
//! Keep `terminationGracePeriodSeconds` above the grace period plus one
//! access-log flush.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::access_log::LogDrainer;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::Router;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often idle rate-limit buckets are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    shutdown_grace: Duration,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Errors
    ///
    /// [`Error::Addr`] if `addr` is not a valid `host:port` string.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// let server = warden::Server::bind("0.0.0.0:8000")?;
    /// # Ok::<(), warden::Error>(())
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|source| Error::Addr { addr: addr.to_owned(), source })?;
        Ok(Self { addr, shutdown_grace: DEFAULT_SHUTDOWN_GRACE })
    }

    /// How long shutdown waits for open connections before aborting them.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Serves `router` behind `gateway` until SIGTERM or Ctrl-C.
    ///
    /// Returns only after a full graceful shutdown, including the final
    /// access-log flush.
    pub async fn serve(self, router: Router, gateway: Gateway, drainer: LogDrainer) -> Result<(), Error> {
        self.serve_with_shutdown(router, gateway, drainer, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but stops when `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        router: Router,
        gateway: Gateway,
        drainer: LogDrainer,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        let router = Arc::new(router);
        let log = gateway.log().clone();
        let drain_task = tokio::spawn(drainer.run());
        let sweep_task = tokio::spawn(sweep_idle_buckets(gateway.clone()));

        info!(addr = %self.addr, "warden listening");

        // Flipped to `true` once; every connection task watches it.
        let (closing_tx, closing_rx) = watch::channel(false);

        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM stops accepting even
                // while connections are still queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    tasks.spawn(serve_connection(
                        stream,
                        remote_addr,
                        Arc::clone(&router),
                        gateway.clone(),
                        closing_rx.clone(),
                        self.shutdown_grace,
                    ));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        closing_tx.send_replace(true);
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "connections outlived the shutdown grace period, aborting");
            tasks.shutdown().await;
        }

        sweep_task.abort();

        // Nothing can submit any more: let the drainer flush and exit.
        log.stop();
        match drain_task.await {
            Ok(stats) => info!(
                flushed = stats.flushed,
                dropped = stats.dropped,
                lost = stats.lost,
                "warden stopped"
            ),
            Err(e) => error!("access-log drainer failed: {e}"),
        }
        Ok(())
    }
}

// ── Connections ───────────────────────────────────────────────────────────────

/// Drives one connection until the peer closes it or shutdown begins.
///
/// On shutdown the connection finishes the request in flight (HTTP/1) or
/// sends GOAWAY (HTTP/2), then closes. It gets `grace` to do so.
async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Arc<Router>,
    gateway: Gateway,
    mut closing: watch::Receiver<bool>,
    grace: Duration,
) {
    // The closure is called once per request on the connection, not once
    // per connection.
    let svc = service_fn(move |req| {
        let router = Arc::clone(&router);
        let gateway = gateway.clone();
        async move { dispatch(router, gateway, req, remote_addr).await }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates. The connection borrows it, so it lives on this frame.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    tokio::select! {
        res = &mut conn => {
            if let Err(e) = res {
                error!(peer = %remote_addr, "connection error: {e}");
            }
        }
        () = async { let _ = closing.wait_for(|closing| *closing).await; } => {
            debug!(peer = %remote_addr, "closing connection for shutdown");
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(grace, conn).await {
                Ok(Err(e)) => error!(peer = %remote_addr, "connection error: {e}"),
                Ok(Ok(())) => {}
                Err(_) => warn!(peer = %remote_addr, "connection did not close within the grace period"),
            }
        }
    }
}

/// Periodically forgets rate-limit buckets that have refilled completely.
async fn sweep_idle_buckets(gateway: Gateway) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; there is nothing to sweep yet.
    tick.tick().await;
    loop {
        tick.tick().await;
        gateway.limiter().sweep_idle();
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Buffers one request body and runs it through the gateway.
///
/// Infallible towards hyper: every failure becomes an HTTP response.
async fn dispatch(
    router: Arc<Router>,
    gateway: Gateway,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_inner());
        }
    };
    let req = Request::new(parts, body).with_remote_addr(remote_addr);

    let response = match gateway.handle(req, |req| async move { router.dispatch(req).await }).await {
        Ok(response) => response,
        Err(failure) => failure.into_response(),
    };
    Ok(response.into_inner())
}

// ── Signals ───────────────────────────────────────────────────────────────────

/// Resolves on SIGTERM (Kubernetes pod termination) or SIGINT (Ctrl-C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
