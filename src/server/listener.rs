//! TCP accept loop.
//!
//! One accept loop runs per bound address and spawns a worker per accepted
//! connection without waiting on it. Concurrency is not pooled: it follows
//! the number of live connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::info;

use crate::http::connection::{serve, ServerContext};
use crate::server::shutdown::{Shutdown, ShutdownSignal};
use crate::server::tracker::ActiveTracker;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Running,
    /// Cancellation fired; in-flight workers are still finishing.
    StopRequested,
    Stopped,
}

/// Cloneable control surface for a running listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    shutdown: Shutdown,
    state: Arc<watch::Sender<ListenerState>>,
    tracker: ActiveTracker,
}

impl ListenerHandle {
    /// Requests a stop. Accepting ends immediately; workers finish their
    /// current message first.
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("Listener stop requested");
        }
        self.state.send_if_modified(|state| {
            if *state == ListenerState::Running {
                *state = ListenerState::StopRequested;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Connections currently being served.
    pub fn active(&self) -> usize {
        self.tracker.active()
    }

    /// Resolves once the listener has fully stopped.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ListenerState::Stopped).await;
    }
}

pub struct Listener {
    sockets: Vec<TcpListener>,
    ctx: ServerContext,
    handle: ListenerHandle,
}

impl Listener {
    /// Binds every address in `addrs`.
    pub async fn bind<A: AsRef<str>>(addrs: &[A], ctx: ServerContext) -> anyhow::Result<Self> {
        if addrs.is_empty() {
            anyhow::bail!("no listen addresses configured");
        }

        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let addr = addr.as_ref();
            let socket = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("Listening on {}", socket.local_addr()?);
            sockets.push(socket);
        }

        let (state, _) = watch::channel(ListenerState::Running);
        Ok(Self {
            sockets,
            ctx,
            handle: ListenerHandle {
                shutdown: Shutdown::new(),
                state: Arc::new(state),
                tracker: ActiveTracker::new(),
            },
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Runs until [`ListenerHandle::stop`] is called, then drains in-flight
    /// connections for up to the configured grace period.
    pub async fn run(self) -> anyhow::Result<()> {
        let Listener {
            sockets,
            ctx,
            handle,
        } = self;

        let mut loops = JoinSet::new();
        for socket in sockets {
            loops.spawn(accept_loop(
                socket,
                ctx.clone(),
                handle.shutdown.subscribe(),
                handle.shutdown.clone(),
                handle.tracker.clone(),
            ));
        }

        while let Some(res) = loops.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Accept loop terminated abnormally");
            }
        }

        // Loops only end on cancellation; make the state reflect it even if
        // the signal came from a dropped coordinator.
        handle.stop();

        let active = handle.tracker.active();
        if active > 0 {
            info!(active, grace = ?ctx.settings.shutdown_grace, "Draining connections");
        }
        let deadline = Instant::now() + ctx.settings.shutdown_grace;
        if !handle.tracker.wait_idle(Some(deadline)).await {
            tracing::warn!(
                active = handle.tracker.active(),
                "Grace period elapsed with connections still open"
            );
        }

        handle.state.send_replace(ListenerState::Stopped);
        info!("Listener stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ServerContext,
    mut signal: ShutdownSignal,
    shutdown: Shutdown,
    tracker: ActiveTracker,
) {
    loop {
        tokio::select! {
            biased;
            _ = signal.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let guard = tracker.track();
                    tracing::debug!(peer = %peer, connection_id = %guard.id(), "Accepted connection");
                    let ctx = ctx.clone();
                    let worker_signal = shutdown.subscribe();
                    tokio::spawn(serve(socket, peer, ctx, worker_signal, guard));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off and keep accepting.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}
