//! 📸 The shared snapshot timestamp of one query job.
//!
//! Every forest must be read at the same point in time, or a document that
//! moves between forests mid-job gets seen twice or not at all. The first
//! forest reader (the leader) reads unpinned and pins whatever timestamp the
//! server reports. Everyone else waits for the pin before their first page.
//!
//! Set once. A later pin attempt gets the value that won.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapshotState {
    Pending,
    Pinned(Arc<str>),
    Abandoned,
}

#[derive(Debug)]
pub(crate) struct Snapshot {
    state: watch::Sender<SnapshotState>,
}

fn resolve(state: &SnapshotState) -> Option<Result<Arc<str>>> {
    match state {
        SnapshotState::Pending => None,
        SnapshotState::Pinned(ts) => Some(Ok(ts.clone())),
        SnapshotState::Abandoned => Some(Err(Error::Snapshot(
            "the leading forest reader stopped before it could pin a timestamp".into(),
        ))),
    }
}

impl Snapshot {
    pub(crate) fn pending() -> Self {
        Self {
            state: watch::Sender::new(SnapshotState::Pending),
        }
    }

    /// 📌 Already pinned by the caller. Nobody reads unpinned.
    pub(crate) fn pinned_at(timestamp: impl Into<Arc<str>>) -> Self {
        Self {
            state: watch::Sender::new(SnapshotState::Pinned(timestamp.into())),
        }
    }

    /// 👀 `None` while pending.
    pub(crate) fn current(&self) -> Option<Result<Arc<str>>> {
        resolve(&self.state.borrow())
    }

    /// 📌 Pin `timestamp` if nothing is pinned yet. Returns the timestamp that won.
    pub(crate) fn pin(&self, timestamp: String) -> Arc<str> {
        let candidate: Arc<str> = Arc::from(timestamp);
        self.state.send_if_modified(|state| {
            if *state == SnapshotState::Pending {
                *state = SnapshotState::Pinned(candidate.clone());
                true
            } else {
                false
            }
        });
        match &*self.state.borrow() {
            SnapshotState::Pinned(winner) => winner.clone(),
            _ => candidate,
        }
    }

    /// 🏳️ Release the waiters with an error. No-op once pinned.
    pub(crate) fn abandon(&self) {
        self.state.send_if_modified(|state| {
            if *state == SnapshotState::Pending {
                *state = SnapshotState::Abandoned;
                true
            } else {
                false
            }
        });
    }

    /// ⏳ Wait until the snapshot is pinned or abandoned.
    pub(crate) async fn resolved(&self) -> Result<Arc<str>> {
        let mut rx = self.state.subscribe();
        let resolved = {
            let state = rx
                .wait_for(|s| *s != SnapshotState::Pending)
                .await
                .map_err(|_| Error::Snapshot("the snapshot keeper vanished".into()))?;
            resolve(&state)
        };
        resolved.unwrap_or_else(|| Err(Error::Snapshot("woke up to a pending snapshot".into())))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn the_one_where_the_first_pin_wins_and_waiters_wake_up() {
        let snapshot = Arc::new(Snapshot::pending());
        assert!(snapshot.current().is_none());

        let waiter = {
            let snapshot = Arc::clone(&snapshot);
            tokio::spawn(async move { snapshot.resolved().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(&*snapshot.pin("100".into()), "100");
        assert_eq!(&*snapshot.pin("200".into()), "100");

        let seen = waiter
            .await
            .expect("💀 the waiter panicked")
            .expect("💀 the waiter got an error instead of a timestamp");
        assert_eq!(&*seen, "100");
    }

    #[tokio::test]
    async fn the_one_where_an_abandoned_snapshot_fails_the_followers() {
        let snapshot = Snapshot::pending();
        snapshot.abandon();
        assert!(matches!(snapshot.resolved().await, Err(Error::Snapshot(_))));

        // 📌 too late, abandonment is final
        assert_eq!(&*snapshot.pin("1".into()), "1");
        assert!(matches!(snapshot.current(), Some(Err(_))));
    }

    #[test]
    fn the_one_where_a_caller_pinned_snapshot_is_never_pending() {
        let snapshot = Snapshot::pinned_at("42");
        let current = snapshot
            .current()
            .expect("💀 should be resolved")
            .expect("💀 should be pinned");
        assert_eq!(&*current, "42");
        snapshot.abandon();
        assert!(matches!(snapshot.current(), Some(Ok(_))));
    }
}
