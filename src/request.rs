//! Incoming request and the per-request context handlers receive.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::actor::Actor;
use crate::exchange::RequestHead;
use crate::response::Entity;
use crate::router::Route;

/// An incoming HTTP request with its body fully buffered.
#[derive(Clone, Debug)]
pub struct Request {
    head: RequestHead,
    body: Bytes,
}

impl Request {
    pub fn new(head: RequestHead, body: Bytes) -> Self {
        Self { head, body }
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn path(&self) -> &str { &self.head.path }
    pub fn query(&self) -> Option<&str> { self.head.query.as_deref() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Everything the pipeline learned about one request.
///
/// Built when the head is complete, filled in stage by stage, and handed to
/// the handler by value.
pub struct RequestContext {
    request: Request,
    route: Arc<Route>,
    entity: Entity,
    actor: Option<Actor>,
}

impl RequestContext {
    pub fn new(request: Request, route: Arc<Route>) -> Self {
        Self { request, route, entity: Entity::Empty, actor: None }
    }

    pub fn request(&self) -> &Request { &self.request }
    pub fn route(&self) -> &Route { &self.route }

    /// The negotiated body.
    pub fn entity(&self) -> &Entity { &self.entity }

    /// `None` when every authenticator in the chain passed.
    pub fn actor(&self) -> Option<&Actor> { self.actor.as_ref() }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn take_entity(&mut self) -> Entity {
        std::mem::take(&mut self.entity)
    }

    pub(crate) fn set_entity(&mut self, entity: Entity) {
        self.entity = entity;
    }

    pub(crate) fn set_actor(&mut self, actor: Option<Actor>) {
        self.actor = actor;
    }
}
