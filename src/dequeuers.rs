use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Thread-safe registry of blocked dequeue attempts.
///
/// Each waiter owns a one-slot channel. [`Dequeuers::notify_all`] never blocks:
/// a waiter that still has an unconsumed wakeup is skipped, it is going to
/// retry its claim anyway.
#[derive(Debug, Default)]
pub struct Dequeuers {
    waiters: Mutex<BTreeMap<u64, mpsc::Sender<()>>>,
    next_id: AtomicU64,
}

impl Dequeuers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a waiter. It stays registered until the returned handle is dropped.
    pub fn register(self: &Arc<Self>) -> Dequeuer {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().insert(id, tx);
        Dequeuer {
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    pub fn notify_all(&self) {
        let waiters = self.waiters.lock();
        for tx in waiters.values() {
            let _ = tx.try_send(());
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered waiter, see [`Dequeuers::register`].
#[derive(Debug)]
pub struct Dequeuer {
    id: u64,
    rx: mpsc::Receiver<()>,
    registry: Arc<Dequeuers>,
}

impl Dequeuer {
    /// Resolves once a wakeup arrived.
    pub async fn woken(&mut self) {
        // the sender lives in the registry as long as self does
        let _ = self.rx.recv().await;
    }
}

impl Drop for Dequeuer {
    fn drop(&mut self) {
        self.registry.waiters.lock().remove(&self.id);
    }
}
