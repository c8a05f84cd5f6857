//! Pluggable authentication.
//!
//! An [`Authenticator`] looks at a request and answers one of three ways:
//!
//! - `Ok(Attempt::NotApplicable)`: no credentials of its kind; try the next.
//! - `Ok(Attempt::Resolved(actor))`: done, stop the chain.
//! - `Err(Interrupt::Abort(401 | 403))`: credentials present and refused.
//!
//! The variants are a closed set dispatched in the order they were
//! registered. [`Basic`](BasicAuthenticator) and
//! [`Bearer`](BearerAuthenticator) parse the `Authorization` header
//! themselves and hand only the verification step to an injected async
//! function, optionally through a [`CachingActorsRegistry`]. Parsing always
//! runs, so a malformed header is reported as such even when a cached actor
//! exists for some other credentials.

use std::future::Future;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use http::StatusCode;
use tracing::debug;

use crate::actor::{Actor, CredentialKey, Rejection, Verdict};
use crate::registry::CachingActorsRegistry;
use crate::request::RequestContext;
use crate::response::{Interrupt, Outcome, ServiceResponse};

/// A successful authentication attempt.
#[derive(Debug)]
pub enum Attempt {
    NotApplicable,
    Resolved(Actor),
}

/// Custom authentication scheme.
pub trait Authenticate: Send + Sync {
    fn attempt<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Outcome<Attempt>>;
}

/// One link of the authentication chain.
#[derive(Clone)]
pub enum Authenticator {
    Basic(BasicAuthenticator),
    Bearer(BearerAuthenticator),
    Custom(Arc<dyn Authenticate>),
}

impl Authenticator {
    pub fn custom(auth: impl Authenticate + 'static) -> Self {
        Self::Custom(Arc::new(auth))
    }

    pub async fn attempt(&self, ctx: &RequestContext) -> Outcome<Attempt> {
        match self {
            Self::Basic(a) => a.attempt(ctx).await,
            Self::Bearer(a) => a.attempt(ctx).await,
            Self::Custom(a) => a.attempt(ctx).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Basic(_) => "basic",
            Self::Bearer(_) => "bearer",
            Self::Custom(_) => "custom",
        }
    }
}

impl From<BasicAuthenticator> for Authenticator {
    fn from(a: BasicAuthenticator) -> Self { Self::Basic(a) }
}

impl From<BearerAuthenticator> for Authenticator {
    fn from(a: BearerAuthenticator) -> Self { Self::Bearer(a) }
}

/// Runs the chain in order. `Ok(None)` means anonymous.
pub async fn authenticate(chain: &[Authenticator], ctx: &RequestContext) -> Outcome<Option<Actor>> {
    for auth in chain {
        match auth.attempt(ctx).await? {
            Attempt::Resolved(actor) => {
                debug!(scheme = auth.name(), principal = actor.principal(), "authenticated");
                return Ok(Some(actor));
            }
            Attempt::NotApplicable => continue,
        }
    }
    Ok(None)
}

/// Splits `Authorization: <scheme> <rest>` when the scheme matches.
fn credentials_for<'a>(ctx: &'a RequestContext, scheme: &str) -> Option<&'a str> {
    let value = ctx.request().headers().get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (given, rest) = value.split_once(' ').unwrap_or((value, ""));
    given.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

/// `<scheme> realm="<realm>"<params>`. A realm that cannot be carried in a
/// header value leaves the bare scheme.
fn challenged(status: StatusCode, message: &str, scheme: &'static str, realm: &str, params: &str) -> Interrupt {
    let challenge = format!(r#"{scheme} realm="{}"{params}"#, quote_escaped(realm));
    let value = HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static(scheme));
    Interrupt::Abort(ServiceResponse::error(status, message).with_header(WWW_AUTHENTICATE, value))
}

/// Backslash-escapes `"` and `\` for a quoted-string.
fn quote_escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Verifies through `cache` when present. `verify` is only invoked on a
/// cache miss; the key is stamped on the actor before it is cached.
async fn verify_keyed<F>(cache: Option<&CachingActorsRegistry>, key: CredentialKey, verify: F) -> Verdict
where
    F: FnOnce() -> BoxFuture<'static, Verdict> + Send,
{
    let stamp = key.clone();
    let run = move || verify().map(move |v| v.map(|actor| actor.keyed(stamp)));
    match cache {
        Some(registry) => registry.resolve(&key, run).await,
        None => run().await,
    }
}

// ── Basic ─────────────────────────────────────────────────────────────────────

/// Decoded `user:secret` pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BasicCredentials {
    pub user: String,
    pub secret: String,
}

type BasicVerifier = Arc<dyn Fn(BasicCredentials) -> BoxFuture<'static, Verdict> + Send + Sync>;

/// `Authorization: Basic <base64(user:secret)>`.
#[derive(Clone)]
pub struct BasicAuthenticator {
    realm: String,
    verify: BasicVerifier,
    cache: Option<CachingActorsRegistry>,
}

impl BasicAuthenticator {
    pub fn new<F, Fut>(realm: impl Into<String>, verify: F) -> Self
    where
        F: Fn(BasicCredentials) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        Self {
            realm: realm.into(),
            verify: Arc::new(move |creds| verify(creds).boxed()),
            cache: None,
        }
    }

    /// Memoizes successful verifications in `registry`.
    pub fn cached(mut self, registry: CachingActorsRegistry) -> Self {
        self.cache = Some(registry);
        self
    }

    fn parse(encoded: &str) -> Option<BasicCredentials> {
        let decoded = STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, secret) = decoded.split_once(':')?;
        Some(BasicCredentials { user: user.to_owned(), secret: secret.to_owned() })
    }

    fn reject(&self, status: StatusCode, message: &str) -> Interrupt {
        challenged(status, message, "Basic", &self.realm, r#", charset="UTF-8""#)
    }

    pub async fn attempt(&self, ctx: &RequestContext) -> Outcome<Attempt> {
        let Some(encoded) = credentials_for(ctx, "basic") else {
            return Ok(Attempt::NotApplicable);
        };
        let Some(creds) = Self::parse(encoded) else {
            return Err(self.reject(StatusCode::UNAUTHORIZED, "malformed basic credentials"));
        };
        let key = CredentialKey::derive("basic", &format!("{}:{}", creds.user, creds.secret));
        let verify = Arc::clone(&self.verify);
        match verify_keyed(self.cache.as_ref(), key, move || verify(creds)).await {
            Ok(actor) => Ok(Attempt::Resolved(actor)),
            Err(Rejection::InvalidCredentials) => {
                Err(self.reject(StatusCode::UNAUTHORIZED, "invalid credentials"))
            }
            Err(Rejection::InsufficientScope) => {
                Err(self.reject(StatusCode::FORBIDDEN, "insufficient scope"))
            }
            Err(e @ Rejection::Unavailable(_)) => Err(Interrupt::failure(e)),
        }
    }
}

// ── Bearer ────────────────────────────────────────────────────────────────────

type BearerVerifier = Arc<dyn Fn(String) -> BoxFuture<'static, Verdict> + Send + Sync>;

/// `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct BearerAuthenticator {
    realm: String,
    verify: BearerVerifier,
    cache: Option<CachingActorsRegistry>,
}

impl BearerAuthenticator {
    pub fn new<F, Fut>(realm: impl Into<String>, verify: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        Self {
            realm: realm.into(),
            verify: Arc::new(move |token| verify(token).boxed()),
            cache: None,
        }
    }

    /// Memoizes successful verifications in `registry`.
    pub fn cached(mut self, registry: CachingActorsRegistry) -> Self {
        self.cache = Some(registry);
        self
    }

    fn reject(&self, status: StatusCode, error: &str, message: &str) -> Interrupt {
        challenged(status, message, "Bearer", &self.realm, &format!(r#", error="{error}""#))
    }

    pub async fn attempt(&self, ctx: &RequestContext) -> Outcome<Attempt> {
        let Some(token) = credentials_for(ctx, "bearer") else {
            return Ok(Attempt::NotApplicable);
        };
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(self.reject(StatusCode::UNAUTHORIZED, "invalid_request", "malformed bearer token"));
        }
        let key = CredentialKey::derive("bearer", token);
        let (verify, token) = (Arc::clone(&self.verify), token.to_owned());
        match verify_keyed(self.cache.as_ref(), key, move || verify(token)).await {
            Ok(actor) => Ok(Attempt::Resolved(actor)),
            Err(Rejection::InvalidCredentials) => {
                Err(self.reject(StatusCode::UNAUTHORIZED, "invalid_token", "invalid or expired token"))
            }
            Err(Rejection::InsufficientScope) => {
                Err(self.reject(StatusCode::FORBIDDEN, "insufficient_scope", "insufficient scope"))
            }
            Err(e @ Rejection::Unavailable(_)) => Err(Interrupt::failure(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use http::Method;

    use crate::exchange::RequestHead;
    use crate::request::Request;
    use crate::router::Route;

    async fn noop(_ctx: RequestContext) -> ServiceResponse {
        ServiceResponse::ok()
    }

    fn ctx(authorization: Option<&str>) -> RequestContext {
        let mut head = RequestHead::new(Method::GET, "/");
        if let Some(v) = authorization {
            head.headers.insert(AUTHORIZATION, HeaderValue::from_str(v).unwrap());
        }
        let route = Arc::new(Route::new(Method::GET, "/", noop));
        RequestContext::new(Request::new(head, Bytes::new()), route)
    }

    fn basic_header(user: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{secret}")))
    }

    fn alice_only() -> BasicAuthenticator {
        BasicAuthenticator::new("notes", |c: BasicCredentials| async move {
            if c.user == "alice" && c.secret == "pw" {
                Ok(Actor::new("alice"))
            } else {
                Err(Rejection::InvalidCredentials)
            }
        })
    }

    fn abort_of(outcome: Outcome<Attempt>) -> ServiceResponse {
        match outcome {
            Err(Interrupt::Abort(res)) => res,
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn basic_resolves_and_stamps_key() {
        let got = alice_only().attempt(&ctx(Some(&basic_header("alice", "pw")))).await.unwrap();
        let Attempt::Resolved(actor) = got else { panic!("not resolved") };
        assert_eq!(actor.principal(), "alice");
        assert_eq!(actor.key(), Some(&CredentialKey::derive("basic", "alice:pw")));
    }

    #[tokio::test]
    async fn basic_rejection_carries_challenge() {
        let res = abort_of(alice_only().attempt(&ctx(Some(&basic_header("alice", "nope")))).await);
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()[WWW_AUTHENTICATE], r#"Basic realm="notes", charset="UTF-8""#);
    }

    #[tokio::test]
    async fn basic_malformed_never_reaches_verifier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let auth = BasicAuthenticator::new("r", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(Actor::new("x")) }
        });
        let res = abort_of(auth.attempt(&ctx(Some("Basic !!!not-base64"))).await);
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = abort_of(auth.attempt(&ctx(Some(&format!("Basic {}", STANDARD.encode("nocolon"))))).await);
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_schemes_are_not_applicable() {
        assert!(matches!(alice_only().attempt(&ctx(None)).await, Ok(Attempt::NotApplicable)));
        assert!(matches!(
            alice_only().attempt(&ctx(Some("Bearer abc"))).await,
            Ok(Attempt::NotApplicable)
        ));
    }

    fn scoped_bearer() -> BearerAuthenticator {
        BearerAuthenticator::new("api", |token: String| async move {
            match token.as_str() {
                "good" => Ok(Actor::new("svc").with_scopes(["notes:write"])),
                "narrow" => Err(Rejection::InsufficientScope),
                "down" => Err(Rejection::Unavailable("idp timeout".to_owned())),
                _ => Err(Rejection::InvalidCredentials),
            }
        })
    }

    #[tokio::test]
    async fn bearer_maps_rejections() {
        let auth = scoped_bearer();
        let res = abort_of(auth.attempt(&ctx(Some("Bearer expired"))).await);
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()[WWW_AUTHENTICATE], r#"Bearer realm="api", error="invalid_token""#);

        let res = abort_of(auth.attempt(&ctx(Some("bearer narrow"))).await);
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(res.headers()[WWW_AUTHENTICATE], r#"Bearer realm="api", error="insufficient_scope""#);

        let res = abort_of(auth.attempt(&ctx(Some("Bearer"))).await);
        assert_eq!(res.headers()[WWW_AUTHENTICATE], r#"Bearer realm="api", error="invalid_request""#);

        assert!(matches!(auth.attempt(&ctx(Some("Bearer down"))).await, Err(Interrupt::Failure(_))));
    }

    #[tokio::test]
    async fn realm_is_escaped_in_challenges() {
        let auth = BasicAuthenticator::new(r#"say "hi" \o/"#, |_| async { Err::<Actor, _>(Rejection::InvalidCredentials) });
        let res = abort_of(auth.attempt(&ctx(Some(&basic_header("a", "b")))).await);
        assert_eq!(
            res.headers()[WWW_AUTHENTICATE],
            r#"Basic realm="say \"hi\" \\o/", charset="UTF-8""#
        );
    }

    #[tokio::test]
    async fn unencodable_realm_falls_back_to_the_scheme() {
        let auth = BearerAuthenticator::new("line\nbreak", |_| async { Err::<Actor, _>(Rejection::InvalidCredentials) });
        let res = abort_of(auth.attempt(&ctx(Some("Bearer t"))).await);
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()[WWW_AUTHENTICATE], "Bearer");
    }

    #[tokio::test]
    async fn chain_stops_at_first_resolution() {
        let later = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&later);
        let never = BearerAuthenticator::new("x", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(Rejection::InvalidCredentials) }
        });
        let chain = vec![
            Authenticator::from(scoped_bearer()),
            Authenticator::from(alice_only()),
            Authenticator::from(never),
        ];
        let actor = authenticate(&chain, &ctx(Some(&basic_header("alice", "pw")))).await.unwrap();
        assert_eq!(actor.unwrap().principal(), "alice");
        assert_eq!(later.load(Ordering::SeqCst), 0);

        assert!(authenticate(&chain, &ctx(None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cached_verifier_runs_once_per_credentials() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = CachingActorsRegistry::new(Duration::from_secs(60), None);
        let auth = BearerAuthenticator::new("api", move |token: String| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Actor::new(token)) }
        })
        .cached(registry.clone());

        for _ in 0..3 {
            auth.attempt(&ctx(Some("Bearer tok-1"))).await.unwrap();
        }
        // a malformed header is still reported, not served from cache
        assert!(auth.attempt(&ctx(Some("Bearer tok 1"))).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }
}
