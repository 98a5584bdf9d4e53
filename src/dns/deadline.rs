//! I/O deadline emulation for in-memory connections.
//!
//! A deadline is published through a `watch` channel; waiters always race
//! the latest published instant, so replacing a deadline before it fires
//! can never leave a stale timer behind.

use std::time::Instant;
use tokio::sync::watch;

/// Expirable event with manual arm/disarm
#[derive(Debug)]
pub struct Deadline {
    at: watch::Sender<Option<Instant>>,
}

impl Deadline {
    /// Create a disarmed deadline
    pub fn new() -> Self {
        let (at, _) = watch::channel(None);
        Self { at }
    }

    /// Arm the deadline at `at`, or disarm it with `None`.
    ///
    /// An instant in the past expires immediately. Waiters blocked in
    /// [`Deadline::expired`] re-evaluate against the new value.
    pub fn set(&self, at: Option<Instant>) {
        self.at.send_replace(at);
    }

    /// Currently armed instant
    pub fn get(&self) -> Option<Instant> {
        *self.at.borrow()
    }

    /// Non-blocking check
    pub fn is_expired(&self) -> bool {
        matches!(self.get(), Some(at) if at <= Instant::now())
    }

    /// Resolve once the current deadline is reached. Never resolves while
    /// disarmed.
    pub async fn expired(&self) {
        let mut rx = self.at.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at.into()) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return std::future::pending().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_disarmed_by_default() {
        let deadline = Deadline::new();
        assert!(deadline.get().is_none());
        assert!(!deadline.is_expired());
    }

    #[test]
    fn test_past_expires_immediately() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now() - Duration::from_secs(1)));
        assert!(deadline.is_expired());

        deadline.set(None);
        assert!(!deadline.is_expired());
    }

    #[tokio::test]
    async fn test_future_deadline_fires() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now() + Duration::from_millis(20)));
        assert!(!deadline.is_expired());

        tokio::time::timeout(Duration::from_secs(2), deadline.expired())
            .await
            .expect("deadline should fire");
        assert!(deadline.is_expired());
    }

    #[tokio::test]
    async fn test_rearm_supersedes_pending_deadline() {
        let deadline = Arc::new(Deadline::new());
        deadline.set(Some(Instant::now() + Duration::from_millis(30)));

        let waiter = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                deadline.expired().await;
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        deadline.set(Some(Instant::now() + Duration::from_millis(200)));

        let elapsed = waiter.await.unwrap();
        assert!(elapsed >= Duration::from_millis(150), "fired after {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_disarm_cancels_pending_deadline() {
        let deadline = Arc::new(Deadline::new());
        deadline.set(Some(Instant::now() + Duration::from_millis(20)));
        deadline.set(None);

        let result = tokio::time::timeout(Duration::from_millis(100), deadline.expired()).await;
        assert!(result.is_err(), "disarmed deadline must not fire");
        assert!(!deadline.is_expired());
    }

    proptest! {
        /// Only the most recently set deadline is observable.
        #[test]
        fn prop_last_set_wins(offsets in proptest::collection::vec(proptest::option::of(-1000i64..1000), 1..20)) {
            let deadline = Deadline::new();
            let base = Instant::now();
            let mut last = None;
            for offset in &offsets {
                let at = offset.map(|ms| {
                    if ms < 0 {
                        base.checked_sub(Duration::from_millis(ms.unsigned_abs())).unwrap_or(base)
                    } else {
                        base + Duration::from_secs(3600) + Duration::from_millis(ms as u64)
                    }
                });
                deadline.set(at);
                last = at;
            }
            prop_assert_eq!(deadline.get(), last);
            let expected = matches!(offsets.last(), Some(Some(ms)) if *ms < 0);
            prop_assert_eq!(deadline.is_expired(), expected);
        }
    }
}
