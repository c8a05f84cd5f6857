//! The transport seam.
//!
//! portico does not parse HTTP. A transport hands it one [`Exchange`] per
//! request: a way to receive the head, pull body chunks, and push the
//! response back out. [`Server`](crate::Server) provides the hyper-backed
//! implementation; tests drive the pipeline with scripted ones.
//!
//! [`Emitter`] sits between the pipeline and the exchange and enforces the
//! one rule a transport cannot take back: once the head is committed, it is
//! committed.

use std::io;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;

/// Everything known about a request once its headers are complete.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: None, headers: HeaderMap::new() }
    }
}

/// One request/response exchange on a connection.
///
/// Every method may suspend; the pipeline bounds each call with the idle
/// deadline. Implementations must be cancel-safe in the sense that dropping
/// a returned future leaves the exchange usable for [`abort`](Self::abort).
pub trait Exchange: Send {
    /// Resolves when the request head has been received.
    fn receive_head(&mut self) -> BoxFuture<'_, io::Result<RequestHead>>;

    /// The next body chunk, or `None` at end of body.
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    /// Writes the status line and headers.
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> BoxFuture<'_, io::Result<()>>;

    /// Writes the full response body.
    fn send_body(&mut self, body: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Drops the connection without writing anything further.
    fn abort(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EmitState {
    Pending,
    Committed,
    Finished,
}

/// Commit-once guard over an [`Exchange`]'s write side.
pub struct Emitter<'a, E: Exchange + ?Sized> {
    exchange: &'a mut E,
    state: EmitState,
}

impl<'a, E: Exchange + ?Sized> Emitter<'a, E> {
    pub fn new(exchange: &'a mut E) -> Self {
        Self { exchange, state: EmitState::Pending }
    }

    /// `true` once any head bytes may have reached the wire.
    pub fn is_committed(&self) -> bool {
        self.state != EmitState::Pending
    }

    /// Commits the status and headers. The head counts as committed from the
    /// moment this is called, even if the write itself then fails or is
    /// cancelled.
    pub async fn commit(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), Error> {
        if self.state != EmitState::Pending {
            return Err(Error::AlreadyCommitted);
        }
        self.state = EmitState::Committed;
        self.exchange.send_head(status, headers).await?;
        Ok(())
    }

    /// Writes the body after a successful [`commit`](Self::commit) and closes
    /// the response.
    pub async fn finish(&mut self, body: Bytes) -> Result<(), Error> {
        if self.state != EmitState::Committed {
            return Err(Error::AlreadyCommitted);
        }
        self.state = EmitState::Finished;
        self.exchange.send_body(body).await?;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.state = EmitState::Finished;
        self.exchange.abort();
    }
}
