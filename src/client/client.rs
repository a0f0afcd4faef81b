//! Client-side connection worker.
//!
//! Every request gets its own connection (`Connection: close`): resolve,
//! connect, optionally wrap in a secure channel, write the request, read
//! one response. Failures are retried with a fresh connection only while
//! no response byte has been seen, so a request the server may already be
//! acting on is never sent twice.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use url::Url;

use crate::client::resolver::{Resolver, SystemResolver};
use crate::error::{Error, Result};
use crate::http::framer::{FramingLimits, MessageFramer};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::net::secure::{wrap_stream, CertificateValidator, ChannelIdentity, Role, SecureChannel};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    /// Deadline for the whole response once the request has been written.
    pub read_timeout: Duration,
    /// Reconnect attempts after the first, for pre-response failures only.
    pub max_retries: u32,
    pub limits: FramingLimits,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_retries: 2,
            limits: FramingLimits::default(),
        }
    }
}

/// A failed attempt, and whether the peer had started answering.
struct AttemptError {
    error: Error,
    response_started: bool,
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self {
            error,
            response_started: false,
        }
    }
}

struct Target {
    host: String,
    port: u16,
    secure: bool,
}

#[derive(Clone)]
pub struct HttpClient {
    settings: ClientSettings,
    resolver: Arc<dyn Resolver>,
    secure: Option<Arc<dyn SecureChannel>>,
    validator: Option<CertificateValidator>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(ClientSettings::default())
    }
}

impl HttpClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            resolver: Arc::new(SystemResolver),
            secure: None,
            validator: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Channel used for `https` URLs. Without one, `https` requests fail.
    pub fn with_secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure = Some(channel);
        self
    }

    pub fn with_certificate_validator(mut self, validator: CertificateValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Builds a request whose target is the path and query of `url`.
    pub fn request(method: Method, url: &Url) -> Request {
        let target = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        Request::new(method, target)
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        self.send(&url, Self::request(Method::GET, &url)).await
    }

    /// Sends `request` to the origin named by `url` and reads one response.
    ///
    /// `Host` is filled in from `url` when the request has none, and
    /// `Connection: close` is always set.
    pub async fn send(&self, url: &Url, mut request: Request) -> Result<Response> {
        let target = self.target(url)?;

        if !request.headers.contains("Host") {
            let authority = match url.port() {
                Some(port) => format!("{}:{}", target.host, port),
                None => target.host.clone(),
            };
            request.headers.insert("Host", authority);
        }
        request.headers.insert("Connection", "close");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&target, &request).await {
                Ok(response) => {
                    tracing::debug!(
                        method = %request.method,
                        path = %request.path,
                        status = response.status.as_u16(),
                        attempt,
                        "Request completed"
                    );
                    return Ok(response);
                }
                Err(AttemptError {
                    error,
                    response_started,
                }) => {
                    let retry = !response_started
                        && error.is_retryable()
                        && attempt <= self.settings.max_retries;
                    if !retry {
                        tracing::warn!(
                            method = %request.method,
                            path = %request.path,
                            host = %target.host,
                            error = %error,
                            attempt,
                            response_started,
                            "Request failed"
                        );
                        return Err(error);
                    }
                    tracing::debug!(
                        method = %request.method,
                        path = %request.path,
                        host = %target.host,
                        error = %error,
                        attempt,
                        "Request failed before any response, reconnecting"
                    );
                }
            }
        }
    }

    fn target(&self, url: &Url) -> Result<Target> {
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        if secure && self.secure.is_none() {
            return Err(Error::SecureChannel(
                "https requested but no secure channel is configured".to_string(),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing port")))?;

        Ok(Target { host, port, secure })
    }

    async fn attempt(
        &self,
        target: &Target,
        request: &Request,
    ) -> std::result::Result<Response, AttemptError> {
        let candidates = self.resolver.resolve(&target.host, target.port).await?;
        let (stream, remote) = self.connect(&candidates).await?;
        let local = stream.local_addr().map_err(Error::from)?;
        tracing::trace!(remote = %remote, host = %target.host, "Connected");

        let identity = ChannelIdentity {
            role: Role::Client,
            local,
            remote,
            server_name: Some(target.host.clone()),
        };
        let channel = if target.secure { self.secure.as_ref() } else { None };
        let stream = tokio::time::timeout(
            self.settings.connect_timeout,
            wrap_stream(channel, stream, identity, self.validator.clone()),
        )
        .await
        .map_err(|_| Error::SecureChannel("handshake timed out".to_string()))??;

        let mut framer = MessageFramer::new(stream, self.settings.limits);
        framer.write_request(request).await?;

        let deadline = Instant::now() + self.settings.read_timeout;
        let result = framer.read_response(deadline, request.method).await;
        result.map_err(|error| AttemptError {
            error,
            response_started: framer.bytes_received() > 0,
        })
    }

    /// Tries each candidate in order and returns the first connection.
    async fn connect(&self, candidates: &[SocketAddr]) -> Result<(TcpStream, SocketAddr)> {
        let mut last = None;
        for addr in candidates {
            match tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => return Ok((stream, *addr)),
                Ok(Err(e)) => {
                    tracing::trace!(remote = %addr, error = %e, "Connect failed");
                    last = Some(Error::Connection(e));
                }
                Err(_) => {
                    tracing::trace!(remote = %addr, "Connect timed out");
                    last = Some(Error::Timeout);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::NoAddressFound("no candidates".to_string())))
    }
}
