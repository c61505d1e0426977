//! Background Task Supervision
//!
//! Long-running loops never fail silently: an error return or a panic is
//! published to a [`FatalSlot`] that the owning object re-raises from its
//! per-tick entry point.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::error;

/// First fatal failure of any supervised task.
#[derive(Debug, Default)]
pub struct FatalSlot {
    inner: Mutex<Option<String>>,
}

impl FatalSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a failure. Only the first one is kept.
    pub fn publish(&self, message: impl Into<String>) {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    /// Take the failure, leaving the slot empty.
    pub fn take(&self) -> Option<String> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Whether a failure is waiting.
    pub fn is_set(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Spawn `fut` on `tracker`, routing an error or panic into `fatal`.
pub fn spawn_supervised<F, E>(
    tracker: &TaskTracker,
    name: &'static str,
    fatal: std::sync::Arc<FatalSlot>,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tracker.spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task = name, "Background task failed: {}", e);
                fatal.publish(format!("{}: {}", name, e));
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(task = name, "Background task panicked: {}", reason);
                fatal.publish(format!("{} panicked: {}", name, reason));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_error_is_published_once() {
        let tracker = TaskTracker::new();
        let fatal = Arc::new(FatalSlot::new());

        spawn_supervised(&tracker, "first", fatal.clone(), async { Err::<(), _>("boom") });
        tracker.close();
        tracker.wait().await;

        let tracker = TaskTracker::new();
        spawn_supervised(&tracker, "second", fatal.clone(), async { Err::<(), _>("later") });
        tracker.close();
        tracker.wait().await;

        assert_eq!(fatal.take().as_deref(), Some("first: boom"));
        assert!(fatal.take().is_none());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let tracker = TaskTracker::new();
        let fatal = Arc::new(FatalSlot::new());

        spawn_supervised(&tracker, "sweeper", fatal.clone(), async {
            if fatal_condition() {
                panic!("registry exploded");
            }
            Ok::<(), String>(())
        });
        tracker.close();
        tracker.wait().await;

        let msg = fatal.take().unwrap();
        assert!(msg.contains("sweeper panicked"));
        assert!(msg.contains("registry exploded"));
    }

    fn fatal_condition() -> bool {
        true
    }

    #[tokio::test]
    async fn test_success_leaves_slot_empty() {
        let tracker = TaskTracker::new();
        let fatal = Arc::new(FatalSlot::new());
        spawn_supervised(&tracker, "ok", fatal.clone(), async { Ok::<(), String>(()) });
        tracker.close();
        tracker.wait().await;
        assert!(!fatal.is_set());
    }
}
