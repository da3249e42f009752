use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while a request changes the claim state of one card.
pub struct CardGuard {
    card_number: String,
    _guard: OwnedMutexGuard<()>,
}

impl CardGuard {
    pub fn card_number(&self) -> &str {
        &self.card_number
    }
}

/// One async mutex per card number, so that verify / reject / unverify /
/// transfer on the same card run one at a time within this process.
#[derive(Clone, Default)]
pub struct CardLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, card_number: &str) -> CardGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(card_number.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        CardGuard {
            card_number: card_number.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Lock `primary` and, when it names a different card, `other` too.
    /// Both are taken in card-number order.
    pub async fn acquire_pair(
        &self,
        primary: &str,
        other: &str,
    ) -> (CardGuard, Option<CardGuard>) {
        if other.is_empty() || other == primary {
            return (self.acquire(primary).await, None);
        }
        if primary < other {
            let first = self.acquire(primary).await;
            let second = self.acquire(other).await;
            (first, Some(second))
        } else {
            let first = self.acquire(other).await;
            let second = self.acquire(primary).await;
            (second, Some(first))
        }
    }

    /// Drop entries nobody holds or waits on.
    pub async fn purge_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
