//! Injectable read deadlines
//!
//! The relay has exactly one cancellation mechanism: moving a socket's read
//! deadline. Idle timeout sets it when a session is created, a WireGuard
//! handshake pushes it forward, and Stop injects `now` to terminate a loop
//! immediately. A [`DeadlineHandle`] moves the deadline; the single
//! [`DeadlineWatcher`] races the socket read in `tokio::select!`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Create a deadline pair with the given initial deadline.
///
/// Use an `Instant` far in the future for "no deadline yet".
#[must_use]
pub fn read_deadline(initial: Instant) -> (DeadlineHandle, DeadlineWatcher) {
    let (tx, rx) = watch::channel(initial);
    (
        DeadlineHandle { tx: Arc::new(tx) },
        DeadlineWatcher { rx },
    )
}

/// Shared handle that moves a read deadline.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    tx: Arc<watch::Sender<Instant>>,
}

impl DeadlineHandle {
    /// Move the deadline to `at`. Moving it into the past fires the watcher
    /// immediately.
    pub fn set(&self, at: Instant) {
        self.tx.send_replace(at);
    }

    /// Expire the deadline now, waking the watcher.
    pub fn expire_now(&self) {
        self.set(Instant::now());
    }
}

/// Awaits deadline expiry; owned by the socket's reader task.
#[derive(Debug)]
pub struct DeadlineWatcher {
    rx: watch::Receiver<Instant>,
}

impl DeadlineWatcher {
    /// Sleep until the current deadline, tracking refreshes.
    ///
    /// Cancel-safe: dropping the future and calling again picks up the
    /// latest deadline.
    pub async fn expired(&mut self) {
        loop {
            let at = *self.rx.borrow_and_update();
            tokio::select! {
                () = time::sleep_until(at) => return,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Every handle dropped; honor the last deadline set.
                        let at = *self.rx.borrow();
                        time::sleep_until(at).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_expires_at_deadline() {
        let start = Instant::now();
        let (_handle, mut watcher) = read_deadline(start + Duration::from_secs(180));
        watcher.expired().await;
        assert!(Instant::now() - start >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let start = Instant::now();
        let (handle, mut watcher) = read_deadline(start + Duration::from_secs(2));
        handle.set(start + Duration::from_secs(5));
        watcher.expired().await;
        assert!(Instant::now() - start >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_expire_now_unblocks() {
        let (handle, mut watcher) = read_deadline(Instant::now() + Duration::from_secs(600));
        let task = tokio::spawn(async move { watcher.expired().await });
        handle.expire_now();
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher should fire after expire_now")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_drop_honors_last_deadline() {
        let start = Instant::now();
        let (handle, mut watcher) = read_deadline(start + Duration::from_secs(30));
        drop(handle);
        watcher.expired().await;
        assert!(Instant::now() - start >= Duration::from_secs(30));
    }
}
