//! HTTP/1.x message handling.
//!
//! - **`headers`**: ordered, case-insensitive header map
//! - **`request`** / **`response`**: message types and builders
//! - **`parser`**: start-line and header-block parsing, body framing rules
//! - **`chunked`**: resumable chunked transfer decoder
//! - **`framer`**: reads whole messages off a stream under a deadline
//! - **`writer`**: serializes messages, fixed-length or chunked
//! - **`connection`**: the server-side per-connection state machine
//! - **`mime`**: media ranges used for content-type routing
//!
//! # Connection state machine
//!
//! ```text
//!   Accepted ──► Reading ──► Dispatching ──► Writing ──┬─► Idle ──► Reading ...
//!       │           │                                  │
//!       └───────────┴──── error / EOF / shutdown ──────┴─► Closed
//! ```
//!
//! Shutdown is only observed in `Accepted` and `Idle`, so a message that
//! has started being read is always answered.

pub mod chunked;
pub mod connection;
pub mod framer;
pub mod headers;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use framer::{FramingLimits, MessageFramer};
pub use headers::HeaderMap;
pub use request::{Method, Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, StatusCode};
