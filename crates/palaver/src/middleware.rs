//! Composable request middleware.
//!
//! A chain `[m1, m2, ..., mn]` terminated by a schema handler `h` runs as
//! `m1(req, next)` where `next` continues into `m2` and so on until `h`.
//! A middleware that never calls `next` short-circuits the rest of the
//! chain and the terminal handler. The chain snapshot handed to a request
//! is immutable; middleware registered later only affects later requests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use palaverproto::{Request, WireError};

use crate::schema::TaskHandler;

/// A single link in the handling chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next) -> Result<Value, WireError>;
}

/// Continuation into the rest of the chain and the terminal handler.
pub struct Next {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: TaskHandler,
}

impl Next {
    /// Chain entry point: a continuation positioned before the first
    /// middleware.
    pub fn chain(middlewares: Arc<[Arc<dyn Middleware>]>, terminal: TaskHandler) -> Self {
        Self {
            middlewares,
            index: 0,
            terminal,
        }
    }

    /// Invoke the remainder of the chain on `request`.
    pub fn run(self, request: Request) -> BoxFuture<'static, Result<Value, WireError>> {
        match self.middlewares.get(self.index).cloned() {
            Some(middleware) => {
                let next = Self {
                    middlewares: self.middlewares,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                Box::pin(async move { middleware.handle(request, next).await })
            }
            None => (self.terminal)(request.payload),
        }
    }
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Next) -> BoxFuture<'static, Result<Value, WireError>> + Send + Sync,
{
    async fn handle(&self, request: Request, next: Next) -> Result<Value, WireError> {
        (self.0)(request, next).await
    }
}

/// Wrap a closure as a [`Middleware`].
///
/// The closure must box its future; `async move` blocks compose with
/// `Box::pin` at the call site.
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Request, Next) -> BoxFuture<'static, Result<Value, WireError>> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware(f))
}
