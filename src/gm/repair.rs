//! Supervised reconnect tasks for broken GM connections
//!
//! At most one repair task runs per node. A task retries on a fixed delay
//! until the node reconnects, the connection is closed, or the task is
//! cancelled because the node was evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{GMConnection, GmConnector, GmError};

struct RepairHandle {
    id: u64,
    token: CancellationToken,
}

pub struct RepairSupervisor {
    /// Running repair tasks (gm ip -> handle)
    tasks: Arc<DashMap<String, RepairHandle>>,
    connector: Arc<dyn GmConnector>,
    retry_delay: Duration,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl RepairSupervisor {
    pub fn new(connector: Arc<dyn GmConnector>, retry_delay: Duration, connect_timeout: Duration) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            connector,
            retry_delay,
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start repairing `conn` unless a repair for that node is already running
    pub fn spawn_repair(&self, conn: Arc<GMConnection>) {
        let key = conn.ip.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        match self.tasks.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(gm = %conn.addr(), "Repair already running");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RepairHandle {
                    id,
                    token: token.clone(),
                });
            }
        }

        let tasks = self.tasks.clone();
        let connector = self.connector.clone();
        let retry_delay = self.retry_delay;
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            info!(gm = %conn.addr(), "Starting GM repair");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(gm = %conn.addr(), "GM repair cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(retry_delay) => {
                        match conn.reconnect(connector.as_ref(), connect_timeout).await {
                            Ok(()) => {
                                info!(gm = %conn.addr(), "GM connection repaired");
                                break;
                            }
                            Err(GmError::Closed { .. }) => break,
                            Err(e) => {
                                warn!(gm = %conn.addr(), error = %e, "GM repair attempt failed");
                            }
                        }
                    }
                }
            }
            tasks.remove_if(&key, |_, handle| handle.id == id);
        });
    }

    /// Stop the repair task for `ip`, if any
    pub fn cancel(&self, ip: &str) {
        if let Some((_, handle)) = self.tasks.remove(ip) {
            handle.token.cancel();
        }
    }

    pub fn is_repairing(&self, ip: &str) -> bool {
        self.tasks.contains_key(ip)
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for RepairSupervisor {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().token.cancel();
        }
    }
}
