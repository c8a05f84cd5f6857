//! The request pipeline.
//!
//! [`Application::serve_exchange`] drives one exchange from head to close:
//!
//! ```text
//! receive head ─► limits ─► preflight? ─► route ─► buffer body ─► negotiate
//!      │                        │                                    │
//!      │                        └──────────── 204 ◄──────────────────┤
//!      ▼                                                             ▼
//!   408 on idle              emit ◄── handler ◄── authenticator chain
//! ```
//!
//! Every stage returns `Result<_, Halt>`. A stage that raises a
//! [`ServiceResponse`] ends the pipeline with exactly that response. Any
//! other failure, panics included, is logged and answered with a generic
//! 500. The idle deadline bounds every suspension point; once the response
//! head is committed, an expired deadline drops the connection without
//! another byte.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use http::header::{ALLOW, CONNECTION, CONTENT_TYPE, HeaderName, HeaderValue, ORIGIN};
use http::StatusCode;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::auth::{self, Authenticator};
use crate::cors::CorsPolicy;
use crate::exchange::{Emitter, Exchange, RequestHead};
use crate::guard::{ConnectionGuard, IdleTimeout};
use crate::options::ApplicationOptions;
use crate::request::{Request, RequestContext};
use crate::response::{Interrupt, ServiceResponse};
use crate::router::{Lookup, Router};

const API_VERSION: HeaderName = HeaderName::from_static("api-version");

/// How an exchange ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Closed {
    /// The full response was written.
    Completed(StatusCode),
    /// The connection was dropped without a complete response.
    Aborted,
}

/// Why the pipeline stopped before a handler produced a response.
enum Halt {
    Abort(ServiceResponse),
    Failure(anyhow::Error),
    Idle,
    Disconnected(io::Error),
}

impl From<ServiceResponse> for Halt {
    fn from(res: ServiceResponse) -> Self { Self::Abort(res) }
}

impl From<Interrupt> for Halt {
    fn from(i: Interrupt) -> Self {
        match i {
            Interrupt::Abort(res) => Self::Abort(res),
            Interrupt::Failure(err) => Self::Failure(err),
        }
    }
}

impl From<IdleTimeout> for Halt {
    fn from(_: IdleTimeout) -> Self { Self::Idle }
}

/// Owns configuration, routes and the authenticator chain, and runs every
/// exchange through the pipeline.
///
/// ```rust,no_run
/// use portico::{Application, ApplicationOptions, Method, RequestContext, Router, Server, ServiceResponse};
///
/// #[tokio::main]
/// async fn main() {
///     let router = Router::new().on(Method::GET, "/ping", ping);
///     let app = Application::new(ApplicationOptions::default(), router);
///     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
/// }
///
/// async fn ping(_ctx: RequestContext) -> ServiceResponse {
///     ServiceResponse::text("pong")
/// }
/// ```
pub struct Application {
    options: ApplicationOptions,
    router: Router,
    authenticators: Vec<Authenticator>,
    cors: CorsPolicy,
    api_version: Option<HeaderValue>,
}

impl Application {
    pub fn new(options: ApplicationOptions, router: Router) -> Self {
        let cors = CorsPolicy::new(&options);
        let api_version = options.api_version.as_deref().and_then(|v| {
            HeaderValue::from_str(v)
                .inspect_err(|_| warn!(version = v, "api version is not a valid header value, not sending it"))
                .ok()
        });
        Self { options, router, authenticators: Vec::new(), cors, api_version }
    }

    /// Appends `auth` to the authenticator chain. Order of calls is the order
    /// of attempts.
    pub fn authenticator(mut self, auth: impl Into<Authenticator>) -> Self {
        self.authenticators.push(auth.into());
        self
    }

    pub fn options(&self) -> &ApplicationOptions {
        &self.options
    }

    /// Runs one exchange to completion. Never fails: every outcome is either
    /// a written response or an aborted connection.
    pub async fn serve_exchange<E: Exchange + ?Sized>(&self, exchange: &mut E) -> Closed {
        let mut guard = ConnectionGuard::new(&self.options);

        let head = match guard.within(exchange.receive_head()).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                debug!(error = %e, "connection closed before request head");
                exchange.abort();
                return Closed::Aborted;
            }
            Err(IdleTimeout) => {
                debug!("idle timeout while receiving request head");
                guard.touch();
                return self.emit(exchange, &guard, timed_out(), None).await;
            }
        };
        guard.touch();

        let span = info_span!("exchange", method = %head.method, path = %head.path);
        async move {
            let origin = head.headers.get(ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_owned);

            let outcome = AssertUnwindSafe(self.run(exchange, &mut guard, head)).catch_unwind().await;
            let response = match outcome {
                Ok(Ok(res)) | Ok(Err(Halt::Abort(res))) => res,
                Ok(Err(Halt::Failure(err))) => {
                    error!(error = ?err, "request failed");
                    ServiceResponse::internal_error()
                }
                Err(panic) => {
                    error!(panic = panic_message(&*panic), "request panicked");
                    ServiceResponse::internal_error()
                }
                Ok(Err(Halt::Idle)) => {
                    debug!("idle timeout before response");
                    guard.touch();
                    timed_out()
                }
                Ok(Err(Halt::Disconnected(e))) => {
                    debug!(error = %e, "connection lost while reading body");
                    exchange.abort();
                    return Closed::Aborted;
                }
            };
            self.emit(exchange, &guard, response, origin.as_deref()).await
        }
        .instrument(span)
        .await
    }

    async fn run<E: Exchange + ?Sized>(
        &self,
        exchange: &mut E,
        guard: &mut ConnectionGuard,
        head: RequestHead,
    ) -> Result<ServiceResponse, Halt> {
        guard.check_head(&head)?;

        if CorsPolicy::is_preflight(&head) {
            return Ok(self.cors.preflight(&head, &self.router.methods_for(&head.path)));
        }

        let route = match self.router.lookup(&head.method, &head.path) {
            Lookup::Found(route) => route,
            Lookup::MethodNotAllowed(methods) => return Err(method_not_allowed(&head, &methods).into()),
            Lookup::NotFound => {
                let msg = format!("no route for {} {}", head.method, head.path);
                return Err(ServiceResponse::error(StatusCode::NOT_FOUND, msg).into());
            }
        };

        let body = read_body(exchange, guard).await?;
        let content_type = head.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_owned);
        let mut ctx = RequestContext::new(Request::new(head, body), route);

        let entity = ctx.route().deserializers().negotiate(ctx.request().body(), content_type.as_deref())?;
        ctx.set_entity(entity);

        let actor = guard.within(auth::authenticate(&self.authenticators, &ctx)).await??;
        ctx.set_actor(actor);

        let handler = Arc::clone(ctx.route().handler());
        let response = guard.within(handler.call(ctx)).await??;
        Ok(response)
    }

    async fn emit<E: Exchange + ?Sized>(
        &self,
        exchange: &mut E,
        guard: &ConnectionGuard,
        mut response: ServiceResponse,
        origin: Option<&str>,
    ) -> Closed {
        self.cors.decorate(origin, &mut response);
        if let Some(version) = &self.api_version {
            response.headers_mut().entry(API_VERSION).or_insert_with(|| version.clone());
        }

        let (status, headers, body) = response.into_parts();
        let mut emitter = Emitter::new(exchange);
        match guard.within(emitter.commit(status, headers)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "writing response head failed");
                emitter.abort();
                return Closed::Aborted;
            }
            Err(IdleTimeout) => {
                debug!("idle timeout while writing response head");
                emitter.abort();
                return Closed::Aborted;
            }
        }
        match guard.within(emitter.finish(body)).await {
            Ok(Ok(())) => {
                debug!(status = status.as_u16(), "response sent");
                Closed::Completed(status)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "writing response body failed");
                emitter.abort();
                Closed::Aborted
            }
            Err(IdleTimeout) => {
                debug!("idle timeout after response head, closing silently");
                emitter.abort();
                Closed::Aborted
            }
        }
    }
}

async fn read_body<E: Exchange + ?Sized>(exchange: &mut E, guard: &mut ConnectionGuard) -> Result<Bytes, Halt> {
    let mut buf = BytesMut::new();
    loop {
        match guard.within(exchange.next_chunk()).await? {
            Ok(Some(chunk)) => {
                guard.touch();
                guard.accept_chunk(chunk.len())?;
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(buf.freeze()),
            Err(e) => return Err(Halt::Disconnected(e)),
        }
    }
}

fn timed_out() -> ServiceResponse {
    ServiceResponse::error(StatusCode::REQUEST_TIMEOUT, "request timed out")
        .with_header(CONNECTION, HeaderValue::from_static("close"))
}

fn method_not_allowed(head: &RequestHead, methods: &[http::Method]) -> ServiceResponse {
    let allow = methods.iter().map(http::Method::as_str).collect::<Vec<_>>().join(", ");
    let res = ServiceResponse::error(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("{} not allowed on {}", head.method, head.path),
    );
    match HeaderValue::from_str(&allow) {
        Ok(v) => res.with_header(ALLOW, v),
        Err(_) => res,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
