use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Handle standing in for a suspended client request.
///
/// An operation that returns `WouldBlock` parks its cookie; whichever
/// component completes the work later calls [`Cookie::notify`] exactly once
/// with the terminal status. A cookie carries at most one outstanding
/// blocking operation.
#[derive(Clone, Debug)]
pub struct Cookie {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    status: Mutex<Option<Result<()>>>,
    notified: Notify,
    connected: AtomicBool,
}

impl Cookie {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                status: Mutex::new(None),
                notified: Notify::new(),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Deliver the terminal status. The first notification wins; any later
    /// one indicates a double-completion and is dropped with a warning.
    pub fn notify(&self, status: Result<()>) {
        let mut slot = match self.inner.status.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            tracing::warn!(?status, "dropping duplicate cookie notification");
            return;
        }
        *slot = Some(status);
        drop(slot);
        self.inner.notified.notify_waiters();
        self.inner.notified.notify_one();
    }

    /// The status delivered so far, if any.
    pub fn status(&self) -> Option<Result<()>> {
        self.inner
            .status
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    /// Waits for the terminal status. A disconnected cookie resolves to
    /// `Disconnect`.
    pub async fn wait(&self) -> Result<()> {
        loop {
            if let Some(status) = self.status() {
                return status;
            }
            if !self.is_connected() {
                return Err(Error::Disconnect);
            }
            self.inner.notified.notified().await;
        }
    }

    /// Marks the client gone. Pending contexts holding this cookie observe
    /// the flag and drop the operation.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.notified.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Identity comparison, used to find this cookie in pending queues.
    pub fn same_as(&self, other: &Cookie) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Cookie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_then_wait() {
        let cookie = Cookie::new();
        cookie.notify(Ok(()));
        assert_eq!(cookie.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_then_notify() {
        let cookie = Cookie::new();
        let waiter = cookie.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        // Give the waiter a chance to park first
        tokio::task::yield_now().await;
        cookie.notify(Err(Error::KeyMissing));
        assert_eq!(handle.await.unwrap(), Err(Error::KeyMissing));
    }

    #[tokio::test]
    async fn test_first_notification_wins() {
        let cookie = Cookie::new();
        cookie.notify(Ok(()));
        cookie.notify(Err(Error::TempFailure));
        assert_eq!(cookie.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_disconnect_resolves_waiters() {
        let cookie = Cookie::new();
        let waiter = cookie.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        cookie.disconnect();
        assert_eq!(handle.await.unwrap(), Err(Error::Disconnect));
        assert!(!cookie.is_connected());
    }
}
