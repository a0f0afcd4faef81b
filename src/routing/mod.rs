//! Request dispatch.
//!
//! - **`tree`**: the host → method → path → content-type routing tree
//! - **`template`**: path templates with literal, parameter, and wildcard segments
//! - **`handler`**: the handler and error-handler interfaces
//! - **`auth`**: authentication requirements and authenticators

pub mod auth;
pub mod handler;
pub mod template;
pub mod tree;

pub use auth::{AuthRequirement, Authenticator, TokenAuthenticator};
pub use handler::{error_handler_fn, handler_fn, BoxHandler, ErrorHandler, Handler, PathParams};
pub use template::PathTemplate;
pub use tree::{
    ConflictPolicy, HostKey, MethodKey, NodeSettings, RouteMatch, RouteMiss, RouteOptions,
    RouteQuery, RouteTree,
};

use crate::error::Error;
use crate::http::response::StatusCode;

/// Why a request did not reach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route matched")]
    NotFound,
    #[error("no acceptable content type")]
    NoAcceptableContentType,
    #[error("authentication required")]
    AuthenticationRequired,
}

impl RouteError {
    /// Status used when no error handler produces a response.
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NotFound => StatusCode::NotFound,
            RouteError::NoAcceptableContentType => StatusCode::NotAcceptable,
            RouteError::AuthenticationRequired => StatusCode::Unauthorized,
        }
    }
}

impl From<RouteError> for Error {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NotFound => Error::NotFound,
            RouteError::NoAcceptableContentType => Error::NoAcceptableContentType,
            RouteError::AuthenticationRequired => Error::AuthenticationRequired,
        }
    }
}
