//! Handler registry.
//!
//! Routes are identified by exact path and method. There is no pattern
//! syntax: `/notes` and `/notes/` are different routes. Build the registry
//! once at startup; it is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;

use crate::handler::{BoxedHandler, Handler};
use crate::negotiate::{Deserializer, Deserializers};

/// One registered handler: path + method + optional deserializer table.
pub struct Route {
    method: Method,
    path: String,
    handler: BoxedHandler,
    deserializers: Deserializers,
}

impl Route {
    pub fn new(method: Method, path: &str, handler: impl Handler) -> Self {
        Self {
            method,
            path: path.to_owned(),
            handler: handler.into_boxed_handler(),
            deserializers: Deserializers::default(),
        }
    }

    /// Registers a deserializer for `media_type` (e.g. `"text/csv"`). Once a
    /// route registers any, bodies of other media types are refused with 415.
    pub fn deserializer(mut self, media_type: &str, d: impl Deserializer + 'static) -> Self {
        self.deserializers.insert(media_type, d);
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { &self.path }

    pub(crate) fn handler(&self) -> &BoxedHandler { &self.handler }
    pub(crate) fn deserializers(&self) -> &Deserializers { &self.deserializers }
}

pub(crate) enum Lookup {
    Found(Arc<Route>),
    /// The path exists under other methods.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

/// The handler registry. Each registration returns `self` so calls chain.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Vec<Arc<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `route`.
    ///
    /// # Panics
    ///
    /// Panics if the same path and method are registered twice.
    pub fn route(mut self, route: Route) -> Self {
        let slot = self.routes.entry(route.path.clone()).or_default();
        if slot.iter().any(|r| r.method == route.method) {
            panic!("duplicate route `{} {}`", route.method, route.path);
        }
        slot.push(Arc::new(route));
        self
    }

    /// Shorthand for `route(Route::new(method, path, handler))`.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.route(Route::new(method, path, handler))
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let Some(slot) = self.routes.get(path) else {
            return Lookup::NotFound;
        };
        match slot.iter().find(|r| r.method == *method) {
            Some(route) => Lookup::Found(Arc::clone(route)),
            None => Lookup::MethodNotAllowed(self.methods_for(path)),
        }
    }

    /// Methods registered for `path`, in registration order.
    pub(crate) fn methods_for(&self, path: &str) -> Vec<Method> {
        self.routes
            .get(path)
            .map(|slot| slot.iter().map(|r| r.method.clone()).collect())
            .unwrap_or_default()
    }
}
