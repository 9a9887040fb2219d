use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::upstream::DialTarget;

/// Lifecycle state of a [`BackendInstance`].
///
/// There is no `Cold` variant here: an instance is only ever constructed
/// once a start has been decided on, so it begins life `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Ready,
    Draining,
    Dead,
}

/// Outcome delivered on `ready_rx` once a start attempt settles.
#[derive(Debug, Clone)]
pub enum ReadyOutcome {
    Pending,
    Ready,
    Failed(String),
}

/// Fields that must change together. The idle reaper's "still idle, still
/// Ready" check and a caller's "still Ready, disarm the timer, bump the
/// count" check both read and write `state`, `active_count`, and
/// `idle_timer` as one unit — split across separate atomics, a request
/// could win its acquire a moment after the reaper already decided to drain
/// the same instance, and get dispatched to a backend that's being killed.
#[derive(Debug)]
struct InstanceState {
    state: BackendState,
    active_count: usize,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

/// One running (or starting) backend and its bookkeeping.
///
/// The child process itself is owned exclusively by the task spawned in
/// `LifecycleManager::spawn_and_supervise` — it is never shared behind this
/// struct's lock, so a kill request (idle reap, crash, host shutdown) is
/// always expressed as cancelling `stop_signal` rather than reaching in and
/// mutating a shared process handle. `pid` is mirrored here as a plain
/// atomic purely for diagnostics and tests.
#[derive(Debug)]
pub struct BackendInstance {
    pub key: String,
    pub upstream: DialTarget,
    inner: Mutex<InstanceState>,
    pid: AtomicU32,
    pub started_at: Instant,
    pub stop_signal: CancellationToken,
    ready_tx: watch::Sender<ReadyOutcome>,
    ready_rx: watch::Receiver<ReadyOutcome>,
}

impl BackendInstance {
    pub fn new(key: String, upstream: DialTarget) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(ReadyOutcome::Pending);
        Arc::new(Self {
            key,
            upstream,
            inner: Mutex::new(InstanceState {
                state: BackendState::Starting,
                active_count: 0,
                idle_timer: None,
            }),
            pid: AtomicU32::new(0),
            started_at: Instant::now(),
            stop_signal: CancellationToken::new(),
            ready_tx,
            ready_rx,
        })
    }

    pub async fn state(&self) -> BackendState {
        self.inner.lock().await.state
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<ReadyOutcome> {
        self.ready_rx.clone()
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Settle the ready notifier with success, transitioning Starting→Ready.
    /// Fulfilling more than once is a logic error the caller must avoid;
    /// the watch channel itself tolerates it but callers rely on "exactly
    /// once" to reason about thundering-herd safety.
    pub async fn mark_ready(&self) {
        self.inner.lock().await.state = BackendState::Ready;
        let _ = self.ready_tx.send(ReadyOutcome::Ready);
    }

    pub async fn mark_dead(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.state = BackendState::Dead;
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
        drop(inner);
        let _ = self.ready_tx.send(ReadyOutcome::Failed(reason.into()));
    }

    pub async fn mark_draining(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BackendState::Draining;
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
    }

    /// Atomically verify the instance is still `Ready`, disarm any pending
    /// idle timer, and bump the active-request count. Returns `false` if
    /// the idle reaper already claimed this instance (it observed
    /// `active_count == 0` and flipped it to `Draining` first) — the caller
    /// must treat that as a dead instance and retry against a fresh one,
    /// never dispatch to the backend being torn down.
    pub async fn acquire_if_ready(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != BackendState::Ready {
            return false;
        }
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
        inner.active_count += 1;
        true
    }

    /// Decrement the active-request count. `handle` is a freshly spawned
    /// idle-timeout task; it is kept (and any previous one aborted) only if
    /// the count has reached zero and the instance is still `Ready` —
    /// otherwise it is aborted immediately since nothing should fire. The
    /// decrement and the arm/discard decision happen under the same lock
    /// acquisition `acquire_if_ready` uses, so the two can never observe an
    /// inconsistent view of each other's effect.
    pub async fn release_and_maybe_arm(&self, handle: tokio::task::JoinHandle<()>) -> usize {
        let mut inner = self.inner.lock().await;
        inner.active_count = inner.active_count.saturating_sub(1);
        if inner.active_count == 0 && inner.state == BackendState::Ready {
            if let Some(old) = inner.idle_timer.take() {
                old.abort();
            }
            inner.idle_timer = Some(handle);
        } else {
            handle.abort();
        }
        inner.active_count
    }

    /// Idle-timer callback: if still idle and still `Ready`, transition to
    /// `Draining` and report that the caller should proceed to kill and
    /// deregister the instance. Returns `false` if a request raced ahead
    /// and either bumped the count or the instance already moved on.
    pub async fn begin_drain_if_idle(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active_count != 0 || inner.state != BackendState::Ready {
            return false;
        }
        inner.state = BackendState::Draining;
        inner.idle_timer = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn active_count_tracks_acquire_and_release() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        instance.mark_ready().await;
        assert!(instance.acquire_if_ready().await);
        assert!(instance.acquire_if_ready().await);
        assert_eq!(instance.active_count().await, 2);

        let handle = tokio::spawn(async {});
        assert_eq!(instance.release_and_maybe_arm(handle).await, 1);
        let handle = tokio::spawn(async {});
        assert_eq!(instance.release_and_maybe_arm(handle).await, 0);
    }

    #[tokio::test]
    async fn mark_ready_settles_watch_channel() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        let mut rx = instance.subscribe_ready();
        instance.mark_ready().await;
        rx.changed().await.unwrap();
        assert!(matches!(*rx.borrow(), ReadyOutcome::Ready));
        assert_eq!(instance.state().await, BackendState::Ready);
    }

    #[tokio::test]
    async fn mark_dead_settles_watch_channel_with_failure() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        let mut rx = instance.subscribe_ready();
        instance.mark_dead("spawn failed").await;
        rx.changed().await.unwrap();
        assert!(matches!(*rx.borrow(), ReadyOutcome::Failed(_)));
        assert_eq!(instance.state().await, BackendState::Dead);
    }

    #[test]
    fn pid_is_none_until_set() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        assert_eq!(instance.pid(), None);
        instance.set_pid(42);
        assert_eq!(instance.pid(), Some(42));
    }

    #[tokio::test]
    async fn acquire_fails_once_drained() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        instance.mark_ready().await;
        assert!(instance.begin_drain_if_idle().await, "idle and Ready, should drain");
        assert!(
            !instance.acquire_if_ready().await,
            "a request arriving after the reap decision must not be dispatched"
        );
    }

    #[tokio::test]
    async fn reap_is_a_no_op_once_a_request_has_acquired() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        instance.mark_ready().await;
        assert!(instance.acquire_if_ready().await);
        assert!(
            !instance.begin_drain_if_idle().await,
            "active_count is nonzero, the reaper must back off"
        );
        assert_eq!(instance.state().await, BackendState::Ready);
    }

    #[tokio::test]
    async fn arming_idle_timer_aborts_previous_one() {
        let instance = BackendInstance::new("k".to_string(), DialTarget::Tcp("127.0.0.1:1".to_string()));
        instance.mark_ready().await;
        assert!(instance.acquire_if_ready().await);

        let flag = Arc::new(AtomicUsize::new(0));
        let flag_clone = Arc::clone(&flag);
        let first = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            flag_clone.fetch_add(1, Ordering::SeqCst);
        });
        instance.release_and_maybe_arm(first).await;

        assert!(instance.acquire_if_ready().await, "re-acquire should disarm the first timer");
        let second = tokio::spawn(async {});
        instance.release_and_maybe_arm(second).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(flag.load(Ordering::SeqCst), 0);
    }
}
