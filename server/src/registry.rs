//! Registry of live client connections
//!
//! Tracks every connection currently being serviced so the lifecycle task
//! can tear the server down cleanly: [`ClientRegistry::shutdown_all`] asks
//! every service task to stop reading, and [`ClientRegistry::wait_for_empty`]
//! blocks until the last one has unregistered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::Notify;

/// Maximum number of connections tracked at once; connections beyond this
/// are refused by `register`.
pub const MAX_CLIENTS: usize = 128;

struct RegistryState {
    /// Shutdown slot per live connection, keyed by connection id.
    connections: HashMap<u64, Arc<Notify>>,
    next_id: u64,
}

/// A live connection's membership in the registry.
///
/// Holds the connection id and the shutdown slot the lifecycle task pokes
/// during teardown. The owning service task must call
/// [`ClientRegistry::unregister`] with `id` before exiting.
pub struct ClientHandle {
    pub id: u64,
    shutdown: Arc<Notify>,
}

impl ClientHandle {
    /// Resolves once the registry has asked this connection to shut down.
    /// A request made before the call is not lost.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}

/// Set of live connections with a "drained" signal.
///
/// All operations are safe to call from any task. One waiter on
/// [`wait_for_empty`](Self::wait_for_empty) is supported, which is all the
/// server lifecycle needs.
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
    drained: Notify,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            state: Mutex::new(RegistryState {
                connections: HashMap::new(),
                next_id: 1,
            }),
            drained: Notify::new(),
        }
    }

    /// Adds a connection, returning its handle, or `None` when the registry
    /// is at capacity.
    pub fn register(&self) -> Option<ClientHandle> {
        let mut state = self.state.lock().unwrap();
        if state.connections.len() >= MAX_CLIENTS {
            warn!("registry: refusing connection, {} already live", MAX_CLIENTS);
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;

        let shutdown = Arc::new(Notify::new());
        state.connections.insert(id, Arc::clone(&shutdown));
        debug!("registry: registered {} (count={})", id, state.connections.len());
        Some(ClientHandle { id, shutdown })
    }

    /// Removes a connection; when the last one leaves, wakes the drain
    /// waiter.
    pub fn unregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.connections.remove(&id).is_none() {
            return;
        }
        debug!("registry: unregistered {} (count={})", id, state.connections.len());
        if state.connections.is_empty() {
            drop(state);
            self.drained.notify_one();
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Returns immediately if no connections are live, otherwise blocks
    /// until the count drains to zero.
    ///
    /// The drain signal stores a permit, so an `unregister` racing with
    /// entry to this method cannot be missed; a stale permit only causes one
    /// extra pass through the count check.
    pub async fn wait_for_empty(&self) {
        loop {
            if self.state.lock().unwrap().connections.is_empty() {
                return;
            }
            self.drained.notified().await;
        }
    }

    /// Asks every live connection to stop reading and exit its service
    /// loop. The connections remain registered until their service tasks
    /// unregister on the way out.
    pub fn shutdown_all(&self) {
        let state = self.state.lock().unwrap();
        debug!("registry: shutting down {} connection(s)", state.connections.len());
        for shutdown in state.connections.values() {
            shutdown.notify_one();
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
