use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Tracked connections and their last-active stamps, shared between the
/// accept loop, the connection tasks, and the idle reaper.
pub(crate) struct ServerState {
    connections: Mutex<HashMap<u64, ConnHandle>>,
    epoch: Instant,
    next_id: AtomicU64,
}

/// The state's view of one connection. Cheap to clone; the close token is
/// how the reaper (or a failed writer) tears a connection down.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    id: u64,
    last_active: Arc<AtomicU64>,
    closing: Arc<AtomicBool>,
    close: CancellationToken,
}

impl ConnHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.mark_closing();
        self.close.cancel();
    }
}

impl ServerState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            next_id: AtomicU64::new(0),
        })
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn connection_made(&self) -> ConnHandle {
        let handle = ConnHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            last_active: Arc::new(AtomicU64::new(self.now_millis())),
            closing: Arc::new(AtomicBool::new(false)),
            close: CancellationToken::new(),
        };
        self.connections
            .lock()
            .unwrap()
            .insert(handle.id, handle.clone());
        handle
    }

    pub(crate) fn connection_active(&self, handle: &ConnHandle) {
        handle.last_active.store(self.now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn connection_lost(&self, handle: &ConnHandle) {
        self.connections.lock().unwrap().remove(&handle.id);
    }

    pub(crate) fn current_size(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Close every tracked connection idle strictly longer than `max_idle`.
    /// Connections already on their way out are skipped.
    pub(crate) fn close_idle(&self, max_idle: Duration) {
        let now = self.now_millis();
        let connections = self.connections.lock().unwrap();
        for handle in connections.values() {
            if handle.is_closing() {
                continue;
            }
            let idle = now.saturating_sub(handle.last_active.load(Ordering::Relaxed));
            if idle > max_idle.as_millis() as u64 {
                info!(
                    "connection #{} inactive for over {}s, closing it now",
                    handle.id,
                    max_idle.as_secs()
                );
                handle.cancel();
            }
        }
    }
}

/// Self-rescheduling idle scan, one per server.
pub(crate) struct ReaperTask;

impl ReaperTask {
    pub(crate) fn start(
        state: Arc<ServerState>,
        max_idle_time: Duration,
        shutdown: CancellationToken,
    ) {
        info!(
            "closing connections idle for more than {}s, scanning every {}s",
            max_idle_time.as_secs(),
            max_idle_time.as_secs()
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(max_idle_time) => {
                        debug!("idle scan, track-size={}", state.current_size());
                        state.close_idle(max_idle_time);
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_idle_picks_only_stale_connections() {
        let state = ServerState::new();
        let stale = state.connection_made();
        let fresh = state.connection_made();

        // age the first connection by two seconds
        let now = state.now_millis();
        stale.last_active.store(now.saturating_sub(2_000), Ordering::Relaxed);
        state.connection_active(&fresh);

        state.close_idle(Duration::from_secs(1));

        assert!(stale.close_token().is_cancelled());
        assert!(stale.is_closing());
        assert!(!fresh.close_token().is_cancelled());
    }

    #[test]
    fn test_close_idle_skips_closing_connections() {
        let state = ServerState::new();
        let handle = state.connection_made();
        handle
            .last_active
            .store(0, Ordering::Relaxed);
        handle.mark_closing();

        state.close_idle(Duration::from_millis(1));
        assert!(!handle.close_token().is_cancelled());
    }

    #[test]
    fn test_idle_just_under_the_limit_survives() {
        let state = ServerState::new();
        let handle = state.connection_made();
        let now = state.now_millis();
        handle
            .last_active
            .store(now.saturating_sub(9_900), Ordering::Relaxed);

        state.close_idle(Duration::from_secs(10));
        assert!(!handle.close_token().is_cancelled());
    }

    #[test]
    fn test_connection_lifecycle_tracking() {
        let state = ServerState::new();
        assert_eq!(state.current_size(), 0);
        let a = state.connection_made();
        let b = state.connection_made();
        assert_eq!(state.current_size(), 2);
        state.connection_lost(&a);
        assert_eq!(state.current_size(), 1);
        state.connection_lost(&b);
        assert_eq!(state.current_size(), 0);
    }
}
