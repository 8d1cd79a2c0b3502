use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::debug;

type Entries = Arc<Mutex<HashMap<u64, AbortHandle>>>;

/// Registry of the tasks owning client and tunnel sockets. Aborting a task
/// drops, and therefore closes, every socket it owns.
#[derive(Default)]
pub struct SocketPool {
    next_id: AtomicU64,
    entries: Entries,
    closed: AtomicBool,
}

/// Removes its entry when the owning task ends, however it ends.
struct EntryGuard {
    id: u64,
    entries: Entries,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.entries.lock().remove(&self.id);
    }
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` and tracks it until it completes. Returns `None`, without
    /// running the task, once the pool is closed.
    pub fn spawn<F>(&self, task: F) -> Option<u64>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let guard = EntryGuard {
            id,
            entries: self.entries.clone(),
        };

        // The task waits until its entry exists, so the guard always finds it.
        let (registered, gate) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if gate.await.is_ok() {
                task.await;
            }
        });
        self.entries.lock().insert(id, handle.abort_handle());
        let _ = registered.send(());

        // `close` may have drained the entries before this one was inserted.
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
        }
        Some(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Forcibly ends every tracked task. Nothing is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<AbortHandle> = self.entries.lock().drain().map(|(_, handle)| handle).collect();
        debug!("Closing {} pooled sockets", handles.len());
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn finished_tasks_leave_the_pool() {
        let pool = SocketPool::new();
        pool.spawn(async {}).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instant_tasks_on_other_workers_leave_no_entries() {
        let pool = SocketPool::new();
        for _ in 0..200 {
            pool.spawn(async {}).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn close_aborts_everything_and_refuses_new_work() {
        let pool = SocketPool::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        pool.spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        })
        .unwrap();
        assert_eq!(pool.len(), 1);

        pool.close();
        assert!(rx.await.is_err());
        assert_eq!(pool.len(), 0);
        assert!(pool.spawn(async {}).is_none());
    }
}
