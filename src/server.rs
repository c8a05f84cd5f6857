//! hyper-backed transport and graceful shutdown.
//!
//! Each hyper request becomes one [`Exchange`] and is handed to
//! [`Application::serve_exchange`]. A completed exchange turns into the hyper
//! response; an aborted one makes the service return an error, which tells
//! hyper to drop the connection without writing anything else.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.
//!
//! # Idle connections
//!
//! The configured idle timeout also bounds the connection itself, before the
//! pipeline sees a request: a peer that connects and sends nothing is dropped,
//! and hyper's header-read timeout covers slow heads and idle keep-alive
//! connections between requests.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::app::{Application, Closed};
use crate::error::Error;
use crate::exchange::{Exchange, RequestHead};

/// The HTTP server.
pub struct Server {
    addr: String,
}

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when
    /// [`serve`](Server::serve) is called.
    pub fn bind(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Accepts connections until SIGTERM or Ctrl-C, then drains in-flight
    /// requests and returns.
    pub async fn serve(self, app: Application) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        serve_with_shutdown(listener, app, shutdown_signal()).await
    }
}

/// Serves `app` on an already-bound `listener` until `shutdown` resolves,
/// then waits for in-flight connections to finish.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    app: Application,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let idle = app.options().idle_timeout();
    let builder = connection_builder(idle);
    info!(addr = %listener.local_addr()?, idle_ms = app.options().idle_timeout_ms, "portico listening");
    let app = Arc::new(app);

    let mut tasks = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Check shutdown first so a SIGTERM stops accepting immediately,
            // even if more connections are queued.
            biased;

            () = &mut shutdown => {
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

                let app = Arc::clone(&app);
                let builder = builder.clone();

                tasks.spawn(async move {
                    if !first_bytes_within(&stream, idle).await {
                        debug!(peer = %remote_addr, "no request bytes before idle timeout, closing");
                        return;
                    }
                    let io = TokioIo::new(stream);

                    // Called once per request on the connection.
                    let svc = service_fn(move |req| dispatch(Arc::clone(&app), req));

                    if let Err(e) = builder.serve_connection(io, svc).await {
                        error!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}

    info!("portico stopped");
    Ok(())
}

/// hyper connection settings derived from the idle timeout.
fn connection_builder(idle: Duration) -> ConnBuilder<TokioExecutor> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(idle);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(idle)
        .keep_alive_timeout(idle);
    builder
}

/// Waits for the peer to send something (or close) before protocol
/// detection starts. `false` when the idle timeout passes first.
async fn first_bytes_within(stream: &TcpStream, idle: Duration) -> bool {
    matches!(tokio::time::timeout(idle, stream.readable()).await, Ok(Ok(())))
}

async fn dispatch(
    app: Arc<Application>,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, Error> {
    let mut exchange = HyperExchange::new(req);
    match app.serve_exchange(&mut exchange).await {
        Closed::Completed(_) => exchange.into_response(),
        Closed::Aborted => Err(aborted()),
    }
}

fn aborted() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::ConnectionAborted, "exchange aborted"))
}

/// One hyper request viewed as an [`Exchange`]. The response is collected
/// and handed back to hyper when the pipeline finishes.
struct HyperExchange {
    head: Option<RequestHead>,
    body: Incoming,
    status: Option<StatusCode>,
    headers: HeaderMap,
    out: Bytes,
    aborted: bool,
}

impl HyperExchange {
    fn new(req: hyper::Request<Incoming>) -> Self {
        let (parts, body) = req.into_parts();
        let head = RequestHead {
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers,
        };
        Self {
            head: Some(head),
            body,
            status: None,
            headers: HeaderMap::new(),
            out: Bytes::new(),
            aborted: false,
        }
    }

    fn into_response(self) -> Result<http::Response<Full<Bytes>>, Error> {
        let (Some(status), false) = (self.status, self.aborted) else {
            return Err(aborted());
        };
        let mut res = http::Response::new(Full::new(self.out));
        *res.status_mut() = status;
        *res.headers_mut() = self.headers;
        Ok(res)
    }
}

impl Exchange for HyperExchange {
    fn receive_head(&mut self) -> BoxFuture<'_, io::Result<RequestHead>> {
        let head = self.head.take().ok_or_else(|| io::Error::other("request head already taken"));
        Box::pin(async move { head })
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                match self.body.frame().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(io::Error::other(e)),
                    // Trailers carry no body bytes.
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Ok(Some(data));
                        }
                    }
                }
            }
        })
    }

    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> BoxFuture<'_, io::Result<()>> {
        self.status = Some(status);
        self.headers = headers;
        Box::pin(async { Ok(()) })
    }

    fn send_body(&mut self, body: Bytes) -> BoxFuture<'_, io::Result<()>> {
        self.out = body;
        Box::pin(async { Ok(()) })
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Resolves on the first shutdown signal the process receives: SIGTERM
/// (Kubernetes) or SIGINT (Ctrl-C). On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
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
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
