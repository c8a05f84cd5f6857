//! # portico
//!
//! A RESTful service pipeline on hyper. Every exchange goes through the same
//! stages in the same order:
//!
//! 1. **Guards**: header-count and payload-size limits, plus an idle deadline
//!    that bounds every wait on the peer.
//! 2. **CORS**: preflights are answered without reaching a handler.
//! 3. **Routing**: exact path and method, 404 and 405 with `Allow`.
//! 4. **Content negotiation**: the buffered body becomes an [`Entity`] using
//!    the route's deserializers or the JSON / text / binary defaults.
//! 5. **Authentication**: an ordered chain of [`Authenticator`]s, with
//!    optional single-flight caching of verified credentials.
//! 6. **Handler**, then **emission**: exactly one response per exchange,
//!    stamped with `api-version` when configured.
//!
//! A handler or any stage may end the exchange early by raising a
//! [`ServiceResponse`]. Anything else that goes wrong, panics included, is
//! logged and answered with a generic 500.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use portico::{
//!     Application, ApplicationOptions, BearerAuthenticator, Actor, Method, Outcome,
//!     Rejection, RequestContext, Router, Server, ServiceResponse,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::Error> {
//!     let router = Router::new()
//!         .on(Method::GET,  "/notes", list_notes)
//!         .on(Method::POST, "/notes", create_note);
//!
//!     let app = Application::new(ApplicationOptions::builder().api_version("1.0").build(), router)
//!         .authenticator(BearerAuthenticator::new("notes", |token: String| async move {
//!             if token == "s3cret" { Ok(Actor::new("alice")) } else { Err(Rejection::InvalidCredentials) }
//!         }));
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await
//! }
//!
//! async fn list_notes(_ctx: RequestContext) -> ServiceResponse {
//!     ServiceResponse::text("[]")
//! }
//!
//! async fn create_note(ctx: RequestContext) -> Outcome<ServiceResponse> {
//!     let Some(note) = ctx.entity().as_json() else {
//!         return Err(ServiceResponse::error(portico::StatusCode::BAD_REQUEST, "expected a JSON note").into());
//!     };
//!     Ok(ServiceResponse::json(note)?)
//! }
//! ```

mod actor;
mod app;
mod auth;
mod cors;
mod error;
mod exchange;
mod guard;
mod handler;
mod negotiate;
mod options;
mod registry;
mod request;
mod response;
mod router;
mod server;

pub use actor::{Actor, CredentialKey, Rejection, Verdict};
pub use app::{Application, Closed};
pub use auth::{Attempt, Authenticate, Authenticator, BasicAuthenticator, BasicCredentials, BearerAuthenticator};
pub use cors::CorsPolicy;
pub use error::Error;
pub use exchange::{Emitter, Exchange, RequestHead};
pub use guard::{ConnectionGuard, IdleTimeout};
pub use handler::Handler;
pub use negotiate::{BinaryDeserializer, Charset, DecodeError, Deserializer, Deserializers, JsonDeserializer, TextDeserializer};
pub use options::{AllowedOrigins, ApplicationOptions, OptionsBuilder};
pub use registry::{CacheEntry, CachingActorsRegistry};
pub use request::{Request, RequestContext};
pub use response::{Entity, IntoOutcome, IntoResponse, Interrupt, Outcome, ServiceResponse};
pub use router::{Route, Router};
pub use server::{Server, serve_with_shutdown};

pub use http::{HeaderMap, Method, StatusCode};
