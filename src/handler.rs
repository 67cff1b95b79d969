//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! A route table holds handlers of *different* types in one `Vec`, so each is
//! hidden behind a trait object (`dyn ErasedHandler`) and stored uniformly.
//!
//! ```text
//! async fn login(inv: Invocation, route: Arc<RouteDescriptor>, req: Request) -> Result<Outcome>
//!        ↓ RoutePattern::new(…, login)
//! login.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(login))                       ← stored as BoxedHandler
//!        ↓
//! handler.call(inv, route, req)  at request time   ← one vtable dispatch
//!        ↓
//! Box::pin(async { login(…).await.into_outcome() })
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::invocation::Invocation;
use crate::request::Request;
use crate::response::{IntoOutcome, Outcome};
use crate::router::RouteDescriptor;

/// A heap-allocated, type-erased future that resolves to a handler outcome.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, inv: Invocation, route: Arc<RouteDescriptor>, req: Request) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(inv: Invocation, route: Arc<RouteDescriptor>, req: Request) -> impl IntoOutcome
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Invocation, Arc<RouteDescriptor>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Invocation, Arc<RouteDescriptor>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Invocation, Arc<RouteDescriptor>, Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, inv: Invocation, route: Arc<RouteDescriptor>, req: Request) -> BoxFuture {
        let fut = (self.0)(inv, route, req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}
