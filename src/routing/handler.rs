//! Handler interface invoked by the route tree.

use std::future::Future;
use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::routing::RouteError;
use crate::BoxFuture;

/// Parameters captured from a path template, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A request handler. Returning `Err` makes the worker answer with a
/// generic server error and close the connection.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, params: PathParams) -> BoxFuture<'static, anyhow::Result<Response>>;
}

pub type BoxHandler = Arc<dyn Handler>;

/// Builds a route-level error response for a failed match.
pub type ErrorHandler =
    Arc<dyn Fn(&Request, &RouteError) -> anyhow::Result<Response> + Send + Sync>;

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    fn call(&self, request: Request, params: PathParams) -> BoxFuture<'static, anyhow::Result<Response>> {
        Box::pin((self.0)(request, params))
    }
}

/// Wraps an async closure as a [`BoxHandler`].
///
/// ```ignore
/// let hello = handler_fn(|_req, _params| async { Ok(Response::ok("hi")) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wraps a closure as an [`ErrorHandler`].
pub fn error_handler_fn<F>(f: F) -> ErrorHandler
where
    F: Fn(&Request, &RouteError) -> anyhow::Result<Response> + Send + Sync + 'static,
{
    Arc::new(f)
}
