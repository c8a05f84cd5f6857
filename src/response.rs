//! Outgoing response type, the pipeline's short-circuit signal, and the
//! conversion traits handlers return through.
//!
//! A [`ServiceResponse`] plays two roles. Returned from a handler it is the
//! answer. Raised from any stage as [`Interrupt::Abort`] it skips everything
//! that would have run next and goes straight to emission. Any other failure
//! travels as [`Interrupt::Failure`] and is answered with a generic 500.

use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Error;

// ── Entity ────────────────────────────────────────────────────────────────────

/// A parsed request body or an outgoing response body.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Entity {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Entity {
    /// The content type implied by the entity kind.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Empty     => None,
            Self::Json(_)   => Some("application/json"),
            Self::Text(_)   => Some("text/plain; charset=utf-8"),
            Self::Binary(_) => Some("application/octet-stream"),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Self::Empty     => Bytes::new(),
            // `Value`'s Display is compact JSON and cannot fail.
            Self::Json(v)   => Bytes::from(v.to_string()),
            Self::Text(s)   => Bytes::from(s),
            Self::Binary(b) => b,
        }
    }
}

impl From<Value> for Entity {
    fn from(v: Value) -> Self { Self::Json(v) }
}

impl From<String> for Entity {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<&'static str> for Entity {
    fn from(s: &'static str) -> Self { Self::Text(s.to_owned()) }
}

impl From<Bytes> for Entity {
    fn from(b: Bytes) -> Self { Self::Binary(b) }
}

impl From<Vec<u8>> for Entity {
    fn from(b: Vec<u8>) -> Self { Self::Binary(Bytes::from(b)) }
}

// ── ServiceResponse ───────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// The status is fixed at construction. Headers and entity stay mutable until
/// the response is handed to emission, which takes it by value.
///
/// ```rust
/// use portico::ServiceResponse;
///
/// let mut res = ServiceResponse::new(201).unwrap();
/// res.set_header("location", "/notes/7").unwrap();
/// res.set_json(&serde_json::json!({ "id": 7 })).unwrap();
/// ```
#[derive(Debug)]
pub struct ServiceResponse {
    status: StatusCode,
    headers: HeaderMap,
    entity: Entity,
}

impl ServiceResponse {
    /// Creates an empty response with `status`, which must lie in `100..=599`.
    pub fn new(status: u16) -> Result<Self, Error> {
        if !(100..=599).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        let status = StatusCode::from_u16(status).map_err(|_| Error::InvalidStatus(status))?;
        Ok(Self::of(status))
    }

    /// `200 OK` with no body.
    pub fn ok() -> Self {
        Self::of(StatusCode::OK)
    }

    /// `204 No Content`.
    pub fn no_content() -> Self {
        Self::of(StatusCode::NO_CONTENT)
    }

    /// `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<String>) -> Self {
        let mut res = Self::ok();
        res.entity = Entity::Text(body.into());
        res
    }

    /// `200 OK` with a JSON body serialized from `value`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        let mut res = Self::ok();
        res.set_json(value)?;
        Ok(res)
    }

    /// Structured client or server error:
    /// `{"errorCode": "X2-<status>", "errorMessage": <message>}`.
    ///
    /// Codes above 599 are reported as 500.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let status = if status.as_u16() > 599 { StatusCode::INTERNAL_SERVER_ERROR } else { status };
        let mut res = Self::of(status);
        res.entity = Entity::Json(json!({
            "errorCode": format!("X2-{}", status.as_u16()),
            "errorMessage": message.into(),
        }));
        res
    }

    /// The generic 500 every unexpected failure is normalized to.
    pub fn internal_error() -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub(crate) fn of(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), entity: Entity::Empty }
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn entity(&self) -> &Entity { &self.entity }

    /// Sets a header. A later value for the same name replaces the earlier one.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidHeader(name.to_owned()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::InvalidHeader(name.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Typed, infallible variant of [`set_header`](Self::set_header) for
    /// chaining.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn set_entity(&mut self, entity: impl Into<Entity>) -> &mut Self {
        self.entity = entity.into();
        self
    }

    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self, Error> {
        self.entity = Entity::Json(serde_json::to_value(value)?);
        Ok(self)
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Splits the response for the wire. An explicit `content-type` header
    /// wins over the one inferred from the entity.
    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        let Self { status, mut headers, entity } = self;
        if !headers.contains_key(CONTENT_TYPE) {
            if let Some(ct) = entity.content_type() {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
            }
        }
        (status, headers, entity.into_bytes())
    }
}

// ── Interrupt ─────────────────────────────────────────────────────────────────

/// Why a stage stopped the pipeline.
#[derive(Debug)]
pub enum Interrupt {
    /// Answer with this response; skip every remaining stage.
    Abort(ServiceResponse),
    /// Unexpected failure. Logged server-side, answered with a generic 500.
    Failure(anyhow::Error),
}

impl Interrupt {
    pub fn failure(err: impl Into<anyhow::Error>) -> Self {
        Self::Failure(err.into())
    }
}

impl From<ServiceResponse> for Interrupt {
    fn from(res: ServiceResponse) -> Self { Self::Abort(res) }
}

impl<E> From<E> for Interrupt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self { Self::Failure(anyhow::Error::new(err)) }
}

/// Result of one pipeline stage: continue with `T`, or stop.
pub type Outcome<T> = Result<T, Interrupt>;

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into a [`ServiceResponse`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoResponse {
    fn into_response(self) -> ServiceResponse;
}

impl IntoResponse for ServiceResponse {
    fn into_response(self) -> ServiceResponse { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> ServiceResponse { ServiceResponse::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> ServiceResponse { ServiceResponse::text(self) }
}

impl IntoResponse for Value {
    fn into_response(self) -> ServiceResponse {
        let mut res = ServiceResponse::ok();
        res.set_entity(self);
        res
    }
}

/// Return a bare status from a handler: `return StatusCode::NO_CONTENT`.
impl IntoResponse for StatusCode {
    fn into_response(self) -> ServiceResponse {
        ServiceResponse::new(self.as_u16()).unwrap_or_else(|_| ServiceResponse::internal_error())
    }
}

// ── IntoOutcome ───────────────────────────────────────────────────────────────

/// What a handler may return: anything [`IntoResponse`], or a `Result` whose
/// error converts into an [`Interrupt`].
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome<ServiceResponse>;
}

impl<R: IntoResponse> IntoOutcome for R {
    fn into_outcome(self) -> Outcome<ServiceResponse> {
        Ok(self.into_response())
    }
}

impl<R, E> IntoOutcome for Result<R, E>
where
    R: IntoResponse,
    E: Into<Interrupt>,
{
    fn into_outcome(self) -> Outcome<ServiceResponse> {
        self.map(IntoResponse::into_response).map_err(Into::into)
    }
}
