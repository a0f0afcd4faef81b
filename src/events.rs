//! Fire-and-forget request/response event notifications.
//!
//! Workers never wait on sinks: each event is delivered on its own task and
//! every sink gets an independent timeout.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::http::request::Request;
use crate::http::response::Response;
use crate::BoxFuture;

#[derive(Debug, Clone)]
pub enum Event {
    Request {
        at: SystemTime,
        request: Request,
    },
    Response {
        at: SystemTime,
        request: Request,
        response: Response,
    },
    Error {
        at: SystemTime,
        request: Option<Request>,
        response: Option<Response>,
        error: String,
    },
}

/// A destination for events. Implementations serialize their own writes.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            match &*event {
                Event::Request { request, .. } => {
                    tracing::debug!(method = %request.method, path = %request.path, "Request received");
                }
                Event::Response { request, response, .. } => {
                    tracing::info!(
                        method = %request.method,
                        path = %request.path,
                        status = response.status.as_u16(),
                        "Request completed"
                    );
                }
                Event::Error { request, error, .. } => {
                    tracing::warn!(
                        method = ?request.as_ref().map(|r| r.method),
                        path = ?request.as_ref().map(|r| r.path.as_str()),
                        error = %error,
                        "Request failed"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Fans events out to every registered sink.
#[derive(Clone)]
pub struct Events {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
    timeout: Duration,
}

impl Default for Events {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Events {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sinks: Arc::new(Vec::new()),
            timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        Arc::make_mut(&mut self.sinks).push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn request(&self, request: &Request) {
        if self.is_empty() {
            return;
        }
        self.emit(Event::Request {
            at: SystemTime::now(),
            request: request.clone(),
        });
    }

    pub fn response(&self, request: &Request, response: &Response) {
        if self.is_empty() {
            return;
        }
        self.emit(Event::Response {
            at: SystemTime::now(),
            request: request.clone(),
            response: response.clone(),
        });
    }

    pub fn error(&self, request: Option<&Request>, response: Option<&Response>, error: &dyn std::fmt::Display) {
        if self.is_empty() {
            return;
        }
        self.emit(Event::Error {
            at: SystemTime::now(),
            request: request.cloned(),
            response: response.cloned(),
            error: error.to_string(),
        });
    }

    fn emit(&self, event: Event) {
        let event = Arc::new(event);
        for sink in self.sinks.iter() {
            let fut = sink.record(Arc::clone(&event));
            let timeout = self.timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Event sink failed"),
                    Err(_) => tracing::warn!(?timeout, "Event sink timed out"),
                }
            });
        }
    }
}
