use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Invoked with the response body (RES) or None (ACK resolution) when the
/// request resolves. The tracker removes the entry *before* calling this, so
/// a callback may re-enter the tracker freely.
pub type ResolveCallback = Box<dyn FnOnce(Option<Value>) + Send + 'static>;

pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

struct RequestHandle {
    on_resolve: ResolveCallback,
    on_timeout: TimeoutCallback,
    ack_received: bool,
    retry_count: u32,
    created_at: Instant,
    timeout_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl RequestHandle {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.timeout_timer.take() {
            timer.abort();
        }
        self.cancel_retry_timer();
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

/// Tracks outstanding requests on the sender side - one entry per single REQ
/// or per chunk of a chunked REQ. Each entry has at most one timeout timer
/// and at most one retry timer; removing an entry cancels both, and both are
/// cancelled before any callback fires.
#[derive(Clone)]
pub struct RequestTracker {
    handles: Arc<Mutex<FxHashMap<String, RequestHandle>>>,
}

impl RequestTracker {
    pub fn new() -> RequestTracker {
        RequestTracker {
            handles: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Stores a handle and arms its one-shot timeout timer. On expiry the
    /// entry is removed first, then `on_timeout` runs.
    pub async fn register(
        &self,
        id: String,
        request_timeout: Duration,
        on_resolve: ResolveCallback,
        on_timeout: TimeoutCallback,
    ) {
        let timeout_timer = {
            let handles = self.handles.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(request_timeout).await;

                let handle = handles.lock().await.remove(&id);
                if let Some(mut handle) = handle {
                    handle.cancel_retry_timer();
                    debug!("request {} timed out after {} retries", id, handle.retry_count);
                    (handle.on_timeout)();
                }
            })
        };

        let handle = RequestHandle {
            on_resolve,
            on_timeout,
            ack_received: false,
            retry_count: 0,
            created_at: Instant::now(),
            timeout_timer: Some(timeout_timer),
            retry_timer: None,
        };

        if let Some(mut previous) = self.handles.lock().await.insert(id, handle) {
            previous.cancel_timers();
        }
    }

    /// Marks the request as acknowledged and stops its retransmissions. The
    /// handle itself stays registered until it resolves or times out.
    pub async fn mark_acked(&self, id: &str) -> bool {
        match self.handles.lock().await.get_mut(id) {
            Some(handle) => {
                handle.ack_received = true;
                handle.cancel_retry_timer();
                true
            }
            None => false,
        }
    }

    /// Replaces the retry timer for `id`. Returns false (and cancels the
    /// passed timer) if the id is unknown.
    pub async fn set_retry_timer(&self, id: &str, timer: JoinHandle<()>) -> bool {
        match self.handles.lock().await.get_mut(id) {
            Some(handle) => {
                handle.cancel_retry_timer();
                handle.retry_timer = Some(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    pub async fn increment_retry(&self, id: &str) -> Option<u32> {
        let mut handles = self.handles.lock().await;
        let handle = handles.get_mut(id)?;
        handle.retry_count += 1;
        Some(handle.retry_count)
    }

    /// `(ack_received, retry_count)`, or None for an unknown id.
    pub async fn retry_state(&self, id: &str) -> Option<(bool, u32)> {
        let handles = self.handles.lock().await;
        let handle = handles.get(id)?;
        Some((handle.ack_received, handle.retry_count))
    }

    /// Cancels both timers, removes the entry and invokes `on_resolve` with
    /// `value` - in that order, so the callback observes a tracker without
    /// the entry. Returns false if the id is unknown; a given entry resolves
    /// at most once.
    pub async fn invoke_and_remove(&self, id: &str, value: Option<Value>) -> bool {
        let handle = self.handles.lock().await.remove(id);
        match handle {
            Some(mut handle) => {
                handle.cancel_timers();
                trace!("resolving request {}", id);
                (handle.on_resolve)(value);
                true
            }
            None => false,
        }
    }

    /// Sweeps entries older than `max_age`, cancelling their timers without
    /// invoking any callback. Safety net for entries whose timers got lost;
    /// independent of per-request timeouts.
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut handles = self.handles.lock().await;

        let stale_ids: Vec<String> = handles
            .iter()
            .filter(|(_, handle)| now.duration_since(handle.created_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale_ids {
            if let Some(mut handle) = handles.remove(id) {
                handle.cancel_timers();
                debug!("removing stale request {}", id);
            }
        }
        stale_ids.len()
    }

    /// Drops all entries without invoking callbacks. Used on engine close.
    pub async fn clear(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.iter_mut() {
            handle.cancel_timers();
        }
        handles.clear();
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}
