//! Per-user mutual exclusion for maintenance runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created async lock per user id.
///
/// Holding the guard returned by [`UserLocks::acquire`] excludes every other
/// run for the same user in this process. Different users never contend.
#[derive(Clone, Debug, Default)]
pub struct UserLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl UserLocks {
    /// Wait for exclusive access to `user_id`.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // Drop entries nobody holds or waits on.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(user_id.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_user_is_serialised() {
        let locks = UserLocks::default();
        let guard = locks.acquire("alice").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("alice").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_users_do_not_contend() {
        let locks = UserLocks::default();
        let _alice = locks.acquire("alice").await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("bob"))
            .await
            .unwrap();
    }
}
