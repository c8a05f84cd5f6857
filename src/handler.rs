//! Handler trait and type erasure.
//!
//! The router holds handlers of different concrete types in one map, so each
//! is erased behind `Arc<dyn ErasedHandler>`:
//!
//! ```text
//! async fn create(ctx: RequestContext) -> Result<ServiceResponse, Interrupt>
//!        ↓ Route::new(Method::POST, "/notes", create)
//! create.into_boxed_handler()          ← Handler blanket impl
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(ctx)  at request time   ← one vtable dispatch
//!        ↓
//! Box::pin(async { create(ctx).await.into_outcome() })
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::request::RequestContext;
use crate::response::{IntoOutcome, Outcome, ServiceResponse};

#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, Outcome<ServiceResponse>>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied automatically by any function or closure with the signature
///
/// ```text
/// async fn name(ctx: RequestContext) -> impl IntoOutcome
/// ```
///
/// which covers plain responses and `Result<impl IntoResponse, E>` where `E`
/// converts into an [`Interrupt`](crate::Interrupt). Sealed.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, Outcome<ServiceResponse>> {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.into_outcome() })
    }
}
