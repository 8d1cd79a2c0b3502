//! Single-flight execution of asynchronous work, memoized by key.
//!
//! The first caller for a key starts the producer; every caller arriving while
//! it runs waits for the same outcome. A success is cached until the key is
//! removed. A failure is handed to every waiter and the key is cleared, so the
//! next caller runs the producer again.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum TaskError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("the producing task was abandoned before completing")]
    Abandoned,
}

type Waiter<T, E> = oneshot::Sender<Result<T, TaskError<E>>>;

enum Slot<T, E> {
    /// `generation` identifies the producer that owns the slot.
    Pending { generation: u64, waiters: Vec<Waiter<T, E>> },
    Done(T),
}

pub struct MemoizedTaskRunner<T, E> {
    entries: Arc<Mutex<HashMap<String, Slot<T, E>>>>,
    generations: AtomicU64,
}

impl<T, E> Default for MemoizedTaskRunner<T, E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }
}

impl<T, E> MemoizedTaskRunner<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the outcome of `producer` for `key`, starting it only if no
    /// result is cached and no other caller is already producing one.
    ///
    /// The producer runs in its own task: dropping the caller that started it
    /// does not strand the other waiters.
    pub async fn run<F>(&self, key: &str, producer: F) -> Result<T, TaskError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let receiver = {
            let mut entries = self.entries.lock();
            let (sender, receiver) = oneshot::channel();
            match entries.get_mut(key) {
                Some(Slot::Done(value)) => return Ok(value.clone()),
                Some(Slot::Pending { waiters, .. }) => {
                    debug!("Joining in-flight task for `{key}`");
                    waiters.push(sender);
                }
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    entries.insert(
                        key.to_owned(),
                        Slot::Pending {
                            generation,
                            waiters: vec![sender],
                        },
                    );
                    self.spawn_producer(key.to_owned(), generation, producer);
                }
            }
            receiver
        };

        receiver.await.unwrap_or(Err(TaskError::Abandoned))
    }

    fn spawn_producer<F>(&self, key: String, generation: u64, producer: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            // A second task so that a panicking producer still releases its waiters.
            let result = match tokio::spawn(producer).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Failed(e)),
                Err(_) => Err(TaskError::Abandoned),
            };

            let waiters = {
                let mut entries = entries.lock();
                let owned = matches!(
                    entries.get(&key),
                    Some(Slot::Pending { generation: owner, .. }) if *owner == generation
                );
                match owned.then(|| entries.remove(&key)).flatten() {
                    Some(Slot::Pending { waiters, .. }) => {
                        if let Ok(ref value) = result {
                            entries.insert(key, Slot::Done(value.clone()));
                        }
                        waiters
                    }
                    // Removed while pending, possibly replaced by a newer producer.
                    _ => {
                        debug!("Discarding the outcome of a removed task for `{key}`");
                        Vec::new()
                    }
                }
            };

            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// Forgets the entry for `key`. Waiters of a pending entry observe `Abandoned`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    #[cfg(test)]
    pub fn is_done(&self, key: &str) -> bool {
        matches!(self.entries.lock().get(key), Some(Slot::Done(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
