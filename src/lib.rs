//! Switchyard - HTTP transport and dispatch engine
//!
//! Turns byte streams into HTTP/1.x messages, routes requests by host,
//! method, path template and content type, and issues client requests
//! over the same framing code.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod net;
pub mod routing;
pub mod server;

use std::future::Future;
use std::pin::Pin;

pub use error::{Error, Result};

/// Boxed future used at trait seams that must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
