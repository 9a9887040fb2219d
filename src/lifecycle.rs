use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HandlerConfig;
use crate::error::LifecycleError;
use crate::instance::{BackendInstance, BackendState, ReadyOutcome};
use crate::process;
use crate::readiness;
use crate::registry::Registry;
use crate::upstream::DialTarget;

/// Owns the registry of backend instances and drives the lazy start / crash
/// detection / idle reap state machine described for `ensure_ready`.
///
/// Subscribes to a host-wide shutdown token: when it fires, every managed
/// instance's process group is terminated and the registry is drained.
pub struct LifecycleManager {
    registry: Registry,
    host_shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(host_shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            host_shutdown,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ensure a ready backend instance exists for `key`, starting one if
    /// necessary, and increment its active-request count on the way out.
    /// Callers must pair every successful return with `release(key)`.
    pub async fn ensure_ready(
        self: &Arc<Self>,
        key: &str,
        config: Arc<HandlerConfig>,
    ) -> Result<Arc<BackendInstance>, LifecycleError> {
        // One retry budget for the ErrBackendDead race: an instance found
        // dead, draining, or reaped out from under us between lookup and
        // dispatch is treated as absent and looped once before surfacing an
        // error to the caller.
        for attempt in 0..2 {
            match self.try_ensure_ready(key, &config).await {
                Ok(instance) => return Ok(instance),
                Err(LifecycleError::BackendDead { .. }) if attempt == 0 => {
                    debug!(key = %key, "backend found dead during ensure_ready, retrying once");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(LifecycleError::BackendDead { key: key.to_string() })
    }

    async fn try_ensure_ready(
        self: &Arc<Self>,
        key: &str,
        config: &Arc<HandlerConfig>,
    ) -> Result<Arc<BackendInstance>, LifecycleError> {
        let upstream = DialTarget::parse(&config.upstream_spec)?;

        let instance = match self.registry.get(key) {
            Some(existing) => match existing.state().await {
                BackendState::Ready | BackendState::Starting => existing,
                BackendState::Draining | BackendState::Dead => {
                    self.registry.remove_if_current(key, &existing);
                    return Err(LifecycleError::BackendDead { key: key.to_string() });
                }
            },
            None => self.start_new_instance(key, config, upstream),
        };

        self.await_ready(&instance, config.startup_timeout).await?;

        // Disarming the idle timer and bumping the active count must happen
        // as one atomic step against the idle reaper's own "still idle,
        // still Ready" check — otherwise a reap decided a moment earlier
        // could still be in flight when this caller is handed the instance.
        if !instance.acquire_if_ready().await {
            self.registry.remove_if_current(key, &instance);
            return Err(LifecycleError::BackendDead { key: key.to_string() });
        }
        Ok(instance)
    }

    fn start_new_instance(
        self: &Arc<Self>,
        key: &str,
        config: &Arc<HandlerConfig>,
        upstream: DialTarget,
    ) -> Arc<BackendInstance> {
        let candidate = BackendInstance::new(key.to_string(), upstream);
        let instance = self.registry.insert_if_absent(Arc::clone(&candidate));

        // Only the caller that actually won the race spawns the process;
        // everyone else (including this caller, if it lost) falls through to
        // `await_ready`, which waits on the winner's notifier.
        if Arc::ptr_eq(&instance, &candidate) {
            self.spawn_and_supervise(Arc::clone(&instance), Arc::clone(config));
        }

        instance
    }

    /// Spawn the backend, wait for readiness, then supervise it until it
    /// exits naturally (crash) or `stop_signal` is cancelled (idle reap or
    /// host shutdown). The process is owned exclusively by this task for its
    /// entire lifetime — nothing else ever touches the `Child` handle, so a
    /// kill is always requested by cancelling the token, never by reaching
    /// into shared state. Every failure branch also removes the instance
    /// from the registry: leaving a `Dead` instance registered would make
    /// every subsequent `ensure_ready` for this key find it, observe
    /// `Dead`, and fail instead of starting a replacement.
    fn spawn_and_supervise(self: &Arc<Self>, instance: Arc<BackendInstance>, config: Arc<HandlerConfig>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut proc = match process::spawn(&instance.key, &config) {
                Ok(proc) => proc,
                Err(e) => {
                    warn!(key = %instance.key, error = %e, "failed to spawn backend");
                    instance.mark_dead(e.to_string()).await;
                    manager.registry.remove_if_current(&instance.key, &instance);
                    return;
                }
            };
            if let Some(pid) = proc.pid() {
                instance.set_pid(pid);
            }

            let ready = tokio::select! {
                r = readiness::wait_until_ready(&instance.upstream, config.readiness_probe.as_ref(), config.startup_timeout) => r,
                _ = instance.stop_signal.cancelled() => Err(()),
            };

            match ready {
                Ok(()) => {
                    info!(key = %instance.key, pid = ?instance.pid(), "backend ready");
                    instance.mark_ready().await;
                }
                Err(()) => {
                    if !instance.stop_signal.is_cancelled() {
                        warn!(key = %instance.key, "backend readiness timed out");
                    }
                    proc.kill().await;
                    instance.mark_dead("readiness timeout").await;
                    manager.registry.remove_if_current(&instance.key, &instance);
                    return;
                }
            }

            tokio::select! {
                status = proc.wait() => {
                    if instance.state().await != BackendState::Draining {
                        warn!(key = %instance.key, exit = ?status.ok().and_then(|s| s.code()), "backend exited unexpectedly");
                        instance.mark_dead("process exited unexpectedly").await;
                        manager.registry.remove_if_current(&instance.key, &instance);
                    }
                }
                _ = instance.stop_signal.cancelled() => {
                    proc.kill().await;
                }
            }
        });
    }

    async fn await_ready(&self, instance: &Arc<BackendInstance>, timeout: Duration) -> Result<(), LifecycleError> {
        if instance.state().await == BackendState::Ready {
            return Ok(());
        }

        let mut rx = instance.subscribe_ready();
        let wait = async {
            loop {
                match &*rx.borrow() {
                    ReadyOutcome::Ready => return Ok(()),
                    ReadyOutcome::Failed(reason) => {
                        return Err(LifecycleError::SpawnFailed {
                            key: instance.key.clone(),
                            source: anyhow::anyhow!(reason.clone()),
                        })
                    }
                    ReadyOutcome::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(LifecycleError::BackendDead {
                        key: instance.key.clone(),
                    });
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::ReadinessTimeout {
                key: instance.key.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Completion hook: decrement the active count and, if it reaches zero
    /// while the instance is still `Ready`, arm the idle timer. A timer task
    /// is always spawned and handed to the instance, which aborts it
    /// immediately if arming turns out not to apply — keeping the spawn
    /// decision and the arm decision under the instance's single lock
    /// avoids a second scheduling race between "should I arm" and "is this
    /// still the active timer".
    pub async fn release(self: &Arc<Self>, instance: Arc<BackendInstance>, idle_timeout: Duration) {
        let manager = Arc::clone(self);
        let timer_instance = Arc::clone(&instance);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            manager.reap_if_idle(timer_instance).await;
        });
        instance.release_and_maybe_arm(handle).await;
    }

    async fn reap_if_idle(&self, instance: Arc<BackendInstance>) {
        if !instance.begin_drain_if_idle().await {
            return;
        }
        info!(key = %instance.key, "idle timeout reached, reaping backend");
        self.registry.remove_if_current(&instance.key, &instance);
        instance.stop_signal.cancel();
    }

    /// Terminate every managed instance's process group. Called when the
    /// host's shutdown signal fires.
    pub async fn shutdown_all(&self) {
        self.host_shutdown.cancel();
        for instance in self.registry.all() {
            instance.mark_draining().await;
            self.registry.remove_if_current(&instance.key, &instance);
            instance.stop_signal.cancel();
        }
    }
}
