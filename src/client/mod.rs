//! HTTP client built on the same framer as the server.

#[allow(clippy::module_inception)]
pub mod client;
pub mod resolver;

pub use client::{ClientSettings, HttpClient};
pub use resolver::{Resolver, StaticResolver, SystemResolver};
