use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::events::Events;
use crate::http::framer::{FramingLimits, MessageFramer};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::net::secure::{wrap_stream, ChannelIdentity, Role, SecureChannel};
use crate::routing::{RouteError, RouteMiss, RouteTree};
use crate::server::shutdown::ShutdownSignal;
use crate::server::tracker::{ActiveGuard, ConnectionId};

/// Timeouts and limits for server-side connection workers.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Deadline for reading one complete message once it has started.
    pub read_timeout: Duration,
    /// How long a persistent connection may sit between messages.
    pub idle_timeout: Duration,
    /// How long the listener waits for in-flight workers when stopping.
    pub shutdown_grace: Duration,
    pub limits: FramingLimits,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            limits: FramingLimits::default(),
        }
    }
}

/// Everything a worker shares with its listener.
#[derive(Clone)]
pub struct ServerContext {
    pub routes: Arc<RouteTree>,
    pub settings: ServerSettings,
    pub events: Events,
    pub secure: Option<Arc<dyn SecureChannel>>,
}

impl ServerContext {
    pub fn new(routes: Arc<RouteTree>, settings: ServerSettings) -> Self {
        Self {
            routes,
            settings,
            events: Events::default(),
            secure: None,
        }
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn with_secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure = Some(channel);
        self
    }
}

pub enum ConnectionState {
    /// Freshly accepted, waiting for the first request to start.
    Accepted,
    /// Persistent connection waiting for its next request.
    Idle,
    Reading,
    Dispatching(Request),
    Writing {
        request: Request,
        response: Response,
        keep_alive: bool,
    },
    Closed,
}

pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    framer: MessageFramer<S>,
    ctx: ServerContext,
    shutdown: ShutdownSignal,
    state: ConnectionState,
    served: u64,
}

/// Accept-side entry point: wraps the socket in the configured secure
/// channel and drives the connection until it closes.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    shutdown: ShutdownSignal,
    guard: ActiveGuard,
) {
    let id = guard.id();
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(connection_id = %id, peer = %peer, error = %e, "Dropping connection");
            return;
        }
    };

    let identity = ChannelIdentity {
        role: Role::Server,
        local,
        remote: peer,
        server_name: None,
    };
    let handshake = wrap_stream(ctx.secure.as_ref(), stream, identity, None);
    let stream = match tokio::time::timeout(ctx.settings.read_timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(connection_id = %id, peer = %peer, error = %e, "Secure channel setup failed");
            return;
        }
        Err(_) => {
            tracing::warn!(connection_id = %id, peer = %peer, "Secure channel setup timed out");
            return;
        }
    };

    let mut conn = Connection::new(stream, peer, ctx, shutdown).with_id(id);
    match conn.run().await {
        Ok(()) => {}
        Err(Error::Connection(e)) => {
            tracing::debug!(connection_id = %id, peer = %peer, error = %e, "Connection dropped");
        }
        Err(e) => {
            tracing::warn!(connection_id = %id, peer = %peer, error = %e, "Connection error");
        }
    }
    drop(guard);
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: SocketAddr, ctx: ServerContext, shutdown: ShutdownSignal) -> Self {
        let limits = ctx.settings.limits;
        Self {
            id: ConnectionId::new(),
            peer,
            framer: MessageFramer::new(stream, limits),
            ctx,
            shutdown,
            state: ConnectionState::Accepted,
            served: 0,
        }
    }

    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Messages answered on this connection so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Accepted => {
                    let wait = self.ctx.settings.read_timeout;
                    self.state = self.await_message(wait).await?;
                }

                ConnectionState::Idle => {
                    let wait = self.ctx.settings.idle_timeout;
                    self.state = self.await_message(wait).await?;
                }

                ConnectionState::Reading => {
                    let deadline = Instant::now() + self.ctx.settings.read_timeout;
                    match self.framer.read_request(deadline).await {
                        Ok(Some(req)) => {
                            tracing::debug!(
                                connection_id = %self.id,
                                method = %req.method,
                                path = %req.path,
                                "Request received"
                            );
                            self.state = ConnectionState::Dispatching(req);
                        }
                        Ok(None) => {
                            self.state = ConnectionState::Closed;
                        }
                        Err(e) => {
                            self.reject(&e).await;
                            return Err(e);
                        }
                    }
                }

                ConnectionState::Dispatching(req) => {
                    self.ctx.events.request(&req);
                    match dispatch(&self.ctx, self.id, &req).await {
                        Some((response, keep_alive)) => {
                            self.state = ConnectionState::Writing {
                                request: req,
                                response,
                                keep_alive,
                            };
                        }
                        None => {
                            self.state = ConnectionState::Closed;
                        }
                    }
                }

                ConnectionState::Writing {
                    request,
                    mut response,
                    keep_alive,
                } => {
                    let keep_alive =
                        keep_alive && !response.wants_close() && !self.shutdown.is_triggered();
                    if !keep_alive {
                        response.headers.insert("Connection", "close");
                    } else if request.version.eq_ignore_ascii_case("HTTP/1.0") {
                        response.headers.insert("Connection", "keep-alive");
                    }
                    if request.method == Method::HEAD {
                        response.body = Bytes::new();
                    }

                    self.framer.write_response(&response).await?;
                    self.served += 1;
                    self.ctx.events.response(&request, &response);

                    self.state = if keep_alive {
                        ConnectionState::Idle
                    } else {
                        ConnectionState::Closed
                    };
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Waits for the first byte of the next message. Shutdown is honoured
    /// here, between messages, never in the middle of one.
    async fn await_message(&mut self, wait: Duration) -> Result<ConnectionState> {
        if self.framer.buffered() > 0 {
            if self.shutdown.is_triggered() {
                return Ok(ConnectionState::Closed);
            }
            return Ok(ConnectionState::Reading);
        }

        let deadline = Instant::now() + wait;
        let ready = tokio::select! {
            biased;
            _ = self.shutdown.recv() => {
                tracing::debug!(connection_id = %self.id, "Closing idle connection on shutdown");
                return Ok(ConnectionState::Closed);
            }
            ready = self.framer.wait_for_data(deadline) => ready,
        };

        match ready {
            Ok(true) if self.shutdown.is_triggered() => Ok(ConnectionState::Closed),
            Ok(true) => Ok(ConnectionState::Reading),
            Ok(false) => {
                tracing::trace!(connection_id = %self.id, peer = %self.peer, "Peer closed connection");
                Ok(ConnectionState::Closed)
            }
            Err(Error::Timeout) => {
                tracing::trace!(connection_id = %self.id, "Connection idle timeout");
                Ok(ConnectionState::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort error response for a failed read, before closing.
    async fn reject(&mut self, error: &Error) {
        let status = match error {
            Error::Timeout => StatusCode::RequestTimeout,
            Error::HeaderTooLarge => StatusCode::HeaderFieldsTooLarge,
            Error::BodyTooLarge => StatusCode::PayloadTooLarge,
            e if e.is_protocol_violation() => StatusCode::BadRequest,
            _ => return,
        };

        tracing::debug!(
            connection_id = %self.id,
            peer = %self.peer,
            error = %error,
            status = status.as_u16(),
            "Rejecting unreadable request"
        );
        self.ctx.events.error(None, None, error);

        let mut response = Response::status_only(status);
        response.headers.insert("Connection", "close");
        if let Err(e) = self.framer.write_response(&response).await {
            tracing::trace!(connection_id = %self.id, error = %e, "Could not deliver rejection");
        }
    }
}

/// Routes and runs the handler. `None` means no response can be
/// produced and the connection should simply close.
async fn dispatch(ctx: &ServerContext, id: ConnectionId, req: &Request) -> Option<(Response, bool)> {
    let matched = match ctx.routes.resolve(req) {
        Ok(matched) => matched,
        Err(miss) => return route_failure(ctx, id, req, miss),
    };

    let handler = Arc::clone(&matched.handler);
    let params = matched.params;
    let call = handler.call(req.clone(), params);

    // A separate task keeps a panicking handler from taking the
    // connection task down with it.
    match tokio::spawn(call).await {
        Ok(Ok(response)) => Some((response, req.keep_alive())),
        Ok(Err(e)) => {
            tracing::error!(
                connection_id = %id,
                route = %matched.template,
                error = %e,
                "Handler failed"
            );
            ctx.events.error(Some(req), None, &e);
            Some((Response::internal_error(), false))
        }
        Err(e) => {
            tracing::error!(
                connection_id = %id,
                route = %matched.template,
                error = %e,
                "Handler panicked"
            );
            ctx.events.error(Some(req), None, &e);
            Some((Response::internal_error(), false))
        }
    }
}

fn route_failure(
    ctx: &ServerContext,
    id: ConnectionId,
    req: &Request,
    miss: RouteMiss,
) -> Option<(Response, bool)> {
    tracing::debug!(
        connection_id = %id,
        method = %req.method,
        path = %req.path,
        error = %miss.error,
        "Route not resolved"
    );

    if let Some(handler) = &miss.error_handler {
        return match handler(req, &miss.error) {
            Ok(response) => Some((response, req.keep_alive())),
            Err(e) => {
                tracing::error!(
                    connection_id = %id,
                    error = %e,
                    "Error handler failed, closing connection"
                );
                ctx.events.error(Some(req), None, &e);
                None
            }
        };
    }

    let mut response = Response::status_only(miss.error.status());
    if miss.error == RouteError::AuthenticationRequired {
        if let Some(challenge) = ctx.routes.authenticator().and_then(|a| a.challenge()) {
            response.headers.insert("WWW-Authenticate", challenge);
        }
    }
    Some((response, req.keep_alive()))
}
