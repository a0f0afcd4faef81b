//! Accept-side plumbing.
//!
//! - **`listener`**: binds TCP addresses and spawns a worker per connection
//! - **`datagram`**: UDP receiver with a worker per datagram
//! - **`shutdown`**: the cancellation signal shared by loops and workers
//! - **`tracker`**: connection ids and in-flight counters used for draining

pub mod datagram;
pub mod listener;
pub mod shutdown;
pub mod tracker;

pub use datagram::{Datagram, DatagramError, DatagramReceiver, DatagramSettings};
pub use listener::{Listener, ListenerHandle, ListenerState};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use tracker::{ActiveGuard, ActiveTracker, ConnectionId};
