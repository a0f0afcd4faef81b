//! UDP receive loop with one worker per datagram.
//!
//! The loop copies exactly the received bytes out of its reusable buffer
//! and hands that owned copy to a freshly spawned worker, so it never waits
//! on a worker before the next `recv_from`.

use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::server::shutdown::{Shutdown, ShutdownSignal};
use crate::server::tracker::ActiveTracker;

/// Pause after a hard receive error so a broken socket cannot spin the loop.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramSettings {
    pub buffer_size: usize,
    /// Upper bound on a single wait in the receive loop.
    pub receive_timeout: Duration,
}

impl Default for DatagramSettings {
    fn default() -> Self {
        Self {
            buffer_size: 65_535,
            receive_timeout: Duration::from_millis(250),
        }
    }
}

/// One received datagram, trimmed to its real length.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub received_at: SystemTime,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("receive failed: {0}")]
    Receive(#[from] io::Error),

    #[error("mapping datagram from {peer} failed: {error}")]
    Map { peer: SocketAddr, error: anyhow::Error },

    #[error("subscriber {index} failed on datagram from {peer}: {error}")]
    Subscriber {
        index: usize,
        peer: SocketAddr,
        error: anyhow::Error,
    },

    #[error("subscriber {index} panicked on datagram from {peer}")]
    SubscriberPanicked { index: usize, peer: SocketAddr },
}

pub type Mapper<T> = Arc<dyn Fn(Datagram) -> anyhow::Result<T> + Send + Sync>;
pub type Subscriber<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

struct Running {
    shutdown: Shutdown,
    task: JoinHandle<()>,
    local: SocketAddr,
}

/// Receives datagrams, maps each one to a `T`, and publishes it to every
/// subscriber. Failures are reported on the error channel returned by
/// [`DatagramReceiver::new`].
pub struct DatagramReceiver<T> {
    mapper: Mapper<T>,
    subscribers: Arc<RwLock<Vec<Subscriber<T>>>>,
    errors: mpsc::UnboundedSender<DatagramError>,
    receive_timeout: Duration,
    tracker: ActiveTracker,
    running: Option<Running>,
}

impl<T> DatagramReceiver<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F>(mapper: F) -> (Self, mpsc::UnboundedReceiver<DatagramError>)
    where
        F: Fn(Datagram) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let (errors, rx) = mpsc::unbounded_channel();
        let receiver = Self {
            mapper: Arc::new(mapper),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            errors,
            receive_timeout: DatagramSettings::default().receive_timeout,
            tracker: ActiveTracker::new(),
            running: None,
        };
        (receiver, rx)
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Adds a subscriber. Takes effect for datagrams received afterwards,
    /// including while the receiver is running.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Arc::new(subscriber));
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local)
    }

    /// Datagram workers still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.active()
    }

    /// Binds `local` and starts the receive loop. Returns the bound address.
    pub async fn start(&mut self, local: &str, buffer_size: usize) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "datagram receiver already running",
            )));
        }
        if buffer_size == 0 {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer size must be positive",
            )));
        }

        let socket = UdpSocket::bind(local).await?;
        let bound = socket.local_addr()?;
        tracing::info!(address = %bound, buffer_size, "Datagram receiver bound");

        let shutdown = Shutdown::new();
        let task = tokio::spawn(receive_loop(
            socket,
            bound,
            buffer_size,
            self.receive_timeout,
            shutdown.subscribe(),
            Arc::clone(&self.mapper),
            Arc::clone(&self.subscribers),
            self.errors.clone(),
            self.tracker.clone(),
        ));

        self.running = Some(Running {
            shutdown,
            task,
            local: bound,
        });
        Ok(bound)
    }

    /// Stops the receive loop. With `wait`, also waits for the loop to exit
    /// and for every in-flight datagram worker to finish.
    pub async fn stop(&mut self, wait: bool) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.trigger();

        if wait {
            if let Err(e) = running.task.await {
                tracing::error!(error = %e, "Datagram receive loop terminated abnormally");
            }
            self.tracker.wait_idle(None).await;
        }
        tracing::info!(address = %running.local, "Datagram receiver stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn receive_loop<T>(
    socket: UdpSocket,
    local: SocketAddr,
    buffer_size: usize,
    receive_timeout: Duration,
    mut signal: ShutdownSignal,
    mapper: Mapper<T>,
    subscribers: Arc<RwLock<Vec<Subscriber<T>>>>,
    errors: mpsc::UnboundedSender<DatagramError>,
    tracker: ActiveTracker,
) where
    T: Send + Sync + 'static,
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        let received = tokio::select! {
            biased;
            _ = signal.recv() => break,
            r = tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)) => r,
        };

        let (n, peer) = match received {
            // Quiet socket; loop around to look at the shutdown signal.
            Err(_) => continue,
            Ok(Err(e)) if is_transient(&e) => continue,
            Ok(Err(e)) => {
                tracing::warn!(address = %local, error = %e, "Datagram receive failed");
                let _ = errors.send(DatagramError::Receive(e));
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
            Ok(Ok(received)) => received,
        };

        let datagram = Datagram {
            data: Bytes::copy_from_slice(&buf[..n]),
            peer,
            local,
            received_at: SystemTime::now(),
        };
        tracing::trace!(peer = %peer, len = n, "Datagram received");

        let guard = tracker.track();
        let mapper = Arc::clone(&mapper);
        let subscribers = Arc::clone(&subscribers);
        let errors = errors.clone();
        tokio::spawn(async move {
            deliver(datagram, &mapper, &subscribers, &errors);
            drop(guard);
        });
    }

    tracing::debug!(address = %local, "Datagram receive loop exited");
}

fn deliver<T>(
    datagram: Datagram,
    mapper: &Mapper<T>,
    subscribers: &RwLock<Vec<Subscriber<T>>>,
    errors: &mpsc::UnboundedSender<DatagramError>,
) {
    let peer = datagram.peer;
    let item = match mapper(datagram) {
        Ok(item) => item,
        Err(error) => {
            let _ = errors.send(DatagramError::Map { peer, error });
            return;
        }
    };

    let snapshot: Vec<Subscriber<T>> = subscribers
        .read()
        .map(|subs| subs.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

    for (index, subscriber) in snapshot.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| subscriber(&item))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let _ = errors.send(DatagramError::Subscriber { index, peer, error });
            }
            Err(_) => {
                let _ = errors.send(DatagramError::SubscriberPanicked { index, peer });
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
