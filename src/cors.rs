//! Cross-origin resource sharing.
//!
//! A preflight is `OPTIONS` carrying both `Origin` and
//! `Access-Control-Request-Method`. It is answered here with `204` and never
//! reaches a handler. When the origin is not on the allow-list the answer
//! carries no `access-control-*` headers at all, which browsers treat as a
//! refusal.
//!
//! Actual requests from an allowed origin get `access-control-allow-origin`
//! attached to whatever response the pipeline produced.

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    HeaderValue, ORIGIN, VARY,
};
use http::Method;
use tracing::debug;

use crate::exchange::RequestHead;
use crate::options::{AllowedOrigins, ApplicationOptions};
use crate::response::ServiceResponse;

pub struct CorsPolicy {
    origins: AllowedOrigins,
    max_age: u64,
}

impl CorsPolicy {
    pub fn new(opts: &ApplicationOptions) -> Self {
        Self { origins: opts.allowed_origins.clone(), max_age: opts.preflight_max_age_secs }
    }

    pub fn is_preflight(head: &RequestHead) -> bool {
        head.method == Method::OPTIONS
            && head.headers.contains_key(ORIGIN)
            && head.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// `*` for any origin, the echoed origin for a listed one, `None` when
    /// the origin is not allowed.
    fn allow_origin(&self, origin: &str) -> Option<HeaderValue> {
        match &self.origins {
            AllowedOrigins::Any => Some(HeaderValue::from_static("*")),
            list if list.allows(origin) => HeaderValue::from_str(origin).ok(),
            _ => None,
        }
    }

    /// Answers a preflight. `registered` are the methods routed for the
    /// requested path; when empty the requested method is echoed.
    pub fn preflight(&self, head: &RequestHead, registered: &[Method]) -> ServiceResponse {
        let mut res = ServiceResponse::no_content();
        if matches!(self.origins, AllowedOrigins::List(_)) {
            res.headers_mut().insert(VARY, HeaderValue::from_static("origin"));
        }
        let origin = head.headers.get(ORIGIN).and_then(|v| v.to_str().ok()).unwrap_or("");
        let Some(allow) = self.allow_origin(origin) else {
            debug!(origin, "preflight from disallowed origin");
            return res;
        };

        let methods = if registered.is_empty() {
            head.headers.get(ACCESS_CONTROL_REQUEST_METHOD).cloned()
        } else {
            let joined = registered.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
            HeaderValue::from_str(&joined).ok()
        };

        let headers = res.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow);
        if let Some(methods) = methods {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Some(requested) = head.headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age));
        res
    }

    /// Adds `access-control-allow-origin` for an allowed `origin`.
    pub fn decorate(&self, origin: Option<&str>, res: &mut ServiceResponse) {
        let Some(allow) = origin.and_then(|o| self.allow_origin(o)) else {
            return;
        };
        let headers = res.headers_mut();
        if matches!(self.origins, AllowedOrigins::List(_)) {
            headers.insert(VARY, HeaderValue::from_static("origin"));
        }
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow);
    }
}
