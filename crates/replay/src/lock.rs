use crate::Wallet;
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Interval at which a blocked acquisition rescans the pool.
pub const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the release notification queue.
const RELEASE_QUEUE_CAPACITY: usize = 1000;

/// Errors returned by [`WalletLockPool::acquire`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The run was cancelled while waiting.
    #[error("wallet acquisition cancelled")]
    Cancelled,
    /// More wallets were requested than the pool holds.
    #[error("requested {requested} wallets but the pool only holds {available}")]
    TooMany {
        /// Requested count.
        requested: usize,
        /// Pool size.
        available: usize,
    },
}

struct LockPoolInner {
    wallets: Vec<Arc<Wallet>>,
    locked: Mutex<Vec<bool>>,
    released: broadcast::Sender<usize>,
}

impl LockPoolInner {
    fn release(&self, indices: &[usize]) {
        {
            let mut locked = self.locked.lock();
            for &index in indices {
                locked[index] = false;
            }
        }
        for &index in indices {
            // No subscriber or a full queue only delays a waiter until its next rescan.
            let _ = self.released.send(index);
        }
    }
}

/// Mutual exclusion over a fixed set of wallets.
///
/// Wallets are locked all-or-nothing: an acquisition either gets every wallet it asked
/// for or none, so two executions never share a wallet and a waiting execution never
/// holds a partial set.
#[derive(Clone)]
pub struct WalletLockPool {
    inner: Arc<LockPoolInner>,
}

impl fmt::Debug for WalletLockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletLockPool")
            .field("wallets", &self.len())
            .field("free", &self.free_count())
            .finish()
    }
}

impl WalletLockPool {
    /// Creates a pool over `wallets`, all free.
    pub fn new(wallets: Vec<Arc<Wallet>>) -> Self {
        let (released, _) = broadcast::channel(RELEASE_QUEUE_CAPACITY);
        let locked = Mutex::new(vec![false; wallets.len()]);
        Self {
            inner: Arc::new(LockPoolInner {
                wallets,
                locked,
                released,
            }),
        }
    }

    /// Number of wallets in the pool.
    pub fn len(&self) -> usize {
        self.inner.wallets.len()
    }

    /// Whether the pool holds no wallets.
    pub fn is_empty(&self) -> bool {
        self.inner.wallets.is_empty()
    }

    /// Number of wallets currently free.
    pub fn free_count(&self) -> usize {
        self.inner.locked.lock().iter().filter(|locked| !**locked).count()
    }

    /// Locks `count` free wallets in one step, or nothing when not enough are free.
    pub fn try_acquire(&self, count: usize) -> Option<WalletLease> {
        let mut locked = self.inner.locked.lock();
        let indices: Vec<usize> = locked
            .iter()
            .enumerate()
            .filter(|(_, locked)| !**locked)
            .map(|(index, _)| index)
            .take(count)
            .collect();
        if indices.len() < count {
            return None;
        }
        for &index in &indices {
            locked[index] = true;
        }
        drop(locked);

        let wallets = indices
            .iter()
            .map(|&index| Arc::clone(&self.inner.wallets[index]))
            .collect();
        Some(WalletLease {
            pool: Arc::clone(&self.inner),
            indices,
            wallets,
        })
    }

    /// Waits until `count` wallets can be locked together.
    ///
    /// Rescans every [`ACQUIRE_RETRY_INTERVAL`] and whenever a wallet is released. Only
    /// cancellation ends the wait early.
    pub async fn acquire(
        &self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<WalletLease, AcquireError> {
        if count > self.len() {
            return Err(AcquireError::TooMany {
                requested: count,
                available: self.len(),
            });
        }
        let mut released = self.inner.released.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            if let Some(lease) = self.try_acquire(count) {
                return Ok(lease);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                // Lagging behind still means something was released.
                result = released.recv() => trace!(?result, "wallet released"),
                _ = tokio::time::sleep(ACQUIRE_RETRY_INTERVAL) => {}
            }
        }
    }
}

/// Wallets locked by one acquisition. Dropping the lease releases them.
pub struct WalletLease {
    pool: Arc<LockPoolInner>,
    indices: Vec<usize>,
    wallets: Vec<Arc<Wallet>>,
}

impl fmt::Debug for WalletLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletLease")
            .field("indices", &self.indices)
            .finish()
    }
}

impl WalletLease {
    /// Locked wallets in pool order.
    pub fn wallets(&self) -> &[Arc<Wallet>] {
        &self.wallets
    }

    /// Pool indices of the locked wallets.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Releases the wallets now.
    pub fn release(self) {}
}

impl Drop for WalletLease {
    fn drop(&mut self) {
        self.pool.release(&self.indices);
    }
}
