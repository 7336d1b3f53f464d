//! Debounced, coalesced proxy reloads.
//!
//! The first [`ReloadCoalescer::reload`] call opens a window and returns a
//! shared handle; every call made before the window closes gets a clone of
//! that same handle. When the window closes the proxy is signalled exactly
//! once and all clones resolve together with the outcome.
//!
//! The window closes (and the pending slot is cleared) *before* the signal is
//! sent, so a caller that arrives while a signal is in flight opens a new
//! window instead of joining a reload that may not include its change.
//! Signals themselves never overlap: a new window waits for the previous
//! signal to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::broadcast;

use super::ProxyReloader;

/// Result of one underlying reload signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// The reload command failed. Logged, never propagated.
    Failed,
}

/// Handle shared by every caller in one debounce window.
pub type PendingReload = Shared<BoxFuture<'static, ReloadOutcome>>;

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

struct Inner {
    delay: Duration,
    reloader: Arc<dyn ProxyReloader>,
    pending: Mutex<Option<PendingReload>>,
    signal_lock: tokio::sync::Mutex<()>,
    signals: AtomicU64,
    events: broadcast::Sender<ReloadOutcome>,
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingReload>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-flight reload primitive.
#[derive(Clone)]
pub struct ReloadCoalescer {
    inner: Arc<Inner>,
}

impl ReloadCoalescer {
    pub fn new(delay: Duration, reloader: Arc<dyn ProxyReloader>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                delay,
                reloader,
                pending: Mutex::new(None),
                signal_lock: tokio::sync::Mutex::new(()),
                signals: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Request a reload. Must be called from within a tokio runtime.
    ///
    /// The reload happens whether or not the returned handle is awaited.
    pub fn reload(&self) -> PendingReload {
        let mut slot = self.inner.slot();
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }

        let inner = Arc::clone(&self.inner);
        let pending = async move {
            tokio::time::sleep(inner.delay).await;
            inner.slot().take();

            let _serial = inner.signal_lock.lock().await;
            let generation = inner.signals.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = match inner.reloader.reload().await {
                Ok(()) => {
                    tracing::info!(generation, "Proxy configuration reloaded");
                    ReloadOutcome::Applied
                }
                Err(e) => {
                    // TODO: retry a failed reload once with backoff before reporting Failed;
                    // today callers proceed optimistically on a possibly stale table.
                    tracing::error!(generation, error = %e, "Proxy reload failed");
                    ReloadOutcome::Failed
                }
            };
            let _ = inner.events.send(outcome);
            outcome
        }
        .boxed()
        .shared();

        *slot = Some(pending.clone());
        drop(slot);

        tokio::spawn(pending.clone());
        pending
    }

    /// Number of reload signals sent so far.
    pub fn generation(&self) -> u64 {
        self.inner.signals.load(Ordering::SeqCst)
    }

    /// Whether a debounce window is currently open.
    pub fn is_pending(&self) -> bool {
        self.inner.slot().is_some()
    }

    /// Receive the outcome of every reload signal.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadOutcome> {
        self.inner.events.subscribe()
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }
}
