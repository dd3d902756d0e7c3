use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// One long-lived HTTP streaming connection.
#[derive(Debug, Clone)]
pub struct HttpConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub path: String,
    pub opened: Instant,
}

impl HttpConnectionInfo {
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

/// Registry of open HTTP streaming connections, kept apart from RTSP
/// sessions.
#[derive(Debug, Default)]
pub struct HttpConnections {
    next_id: AtomicU64,
    live: RwLock<HashMap<u64, HttpConnectionInfo>>,
}

impl HttpConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a connection until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr, path: &str) -> HttpConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = HttpConnectionInfo {
            id,
            peer,
            path: path.to_string(),
            opened: Instant::now(),
        };
        let mut live = self.live.write();
        live.insert(id, info);
        tracing::debug!(id, %peer, path, total = live.len(), "http connection registered");
        HttpConnectionGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.live.read().len()
    }

    pub fn list(&self) -> Vec<HttpConnectionInfo> {
        let mut list: Vec<_> = self.live.read().values().cloned().collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

#[derive(Debug)]
pub struct HttpConnectionGuard {
    registry: Arc<HttpConnections>,
    id: u64,
}

impl HttpConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for HttpConnectionGuard {
    fn drop(&mut self) {
        let mut live = self.registry.live.write();
        if let Some(info) = live.remove(&self.id) {
            tracing::debug!(
                id = self.id,
                peer = %info.peer,
                secs = info.age().as_secs(),
                total = live.len(),
                "http connection closed"
            );
        }
    }
}
