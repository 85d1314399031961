//! Listener supervision and connection accounting

use crate::inbound::InboundListener;
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long shutdown waits for in-flight connections to drain.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Registry of live connections by id.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    live: DashMap<u64, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
        }
    }

    /// Track a connection for its lifetime; dropping the guard removes it.
    pub fn register(self: &Arc<Self>, description: String) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, description);
        ConnectionGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.live.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one tracked connection.
pub struct ConnectionGuard {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.live.remove(&self.id);
    }
}

/// Owns the listeners and drives startup/shutdown.
pub struct Supervisor {
    listeners: Vec<Arc<dyn InboundListener>>,
    registry: Arc<ConnectionRegistry>,
}

impl Supervisor {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Supervisor {
            listeners: Vec::new(),
            registry,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn InboundListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Run until a shutdown signal, then drain connections with a
    /// bounded deadline before aborting what remains.
    pub async fn run(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::config("no inbound listeners configured"));
        }

        let (failure_tx, mut failure_rx) = mpsc::channel::<Error>(self.listeners.len());
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for listener in &self.listeners {
            let listener = listener.clone();
            let failure_tx = failure_tx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.start().await {
                    warn!("{} listener failed: {}", listener.name(), e);
                    let _ = failure_tx.send(e).await;
                }
            }));
        }
        drop(failure_tx);

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                Ok(())
            }
            failed = failure_rx.recv() => {
                match failed {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        };

        // Stop accepting
        for listener in &self.listeners {
            let _ = listener.stop().await;
        }
        for handle in handles {
            handle.abort();
        }

        // Drain in-flight connections up to the deadline
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
        while self.registry.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "aborting {} connections still open at deadline",
                    self.registry.active()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("supervisor stopped");
        outcome
    }
}
