//! Bounded-concurrency worker pool bridging the master client's streaming
//! batches with one async task per item.
//!
//! Ported from the coordinator/worklist design in the original Go
//! `batch.Batch`/`BatchProcessor`: a single coordinator task owns all
//! mutable state (`outstanding`, the worklist, `stopped`); workers are
//! fire-and-forget tasks that report completion on a channel.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A batch of arbitrary items fed to a [`BatchProcessor`].
pub trait Batch: Send + 'static {
    type Item: Send + 'static;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn into_items(self) -> Vec<Self::Item>;
}

impl<T: Send + 'static> Batch for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn into_items(self) -> Vec<Self::Item> {
        self
    }
}

enum Command<I> {
    AddBatch(Vec<I>),
    Stop { terminate: bool },
}

/// Feeds items into a fixed-width pool of worker tasks.
///
/// Lifecycle: construct with a callback and a concurrency bound, feed items
/// via [`add_batch`](Self::add_batch), then call either
/// [`finish`](Self::finish) (drain, block until every item has run) or
/// [`terminate`](Self::terminate) (stop accepting new items and return
/// immediately, letting in-flight workers complete on their own). After
/// either, the processor is unusable.
pub struct BatchProcessor<I> {
    command_tx: mpsc::Sender<Command<I>>,
    finished_rx: Option<mpsc::Receiver<()>>,
    coordinator: Option<JoinHandle<()>>,
}

impl<I: Send + 'static> BatchProcessor<I> {
    /// `callback` must itself await its async work before returning — the
    /// coordinator marks an item "done" only once the returned future
    /// resolves, which is what makes `max_tasks` an actual concurrency bound.
    /// A callback that spawns a detached task and returns immediately (e.g.
    /// `|item| { tokio::spawn(async move { ... }); async {} }`) defeats the
    /// bound: the coordinator would dispatch the next item before the real
    /// work even started.
    pub fn new<F, Fut>(callback: F, max_tasks: usize) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        use std::sync::Arc;

        let callback = Arc::new(callback);
        // Unbuffered: AddBatch blocks until the coordinator is ready for it.
        let (command_tx, mut command_rx) = mpsc::channel::<Command<I>>(1);
        let (finished_tx, finished_rx) = mpsc::channel::<()>(1);
        // Never blocks a worker's completion send.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_tasks.max(1));

        let coordinator = tokio::spawn(async move {
            let mut worklist: Vec<I> = Vec::new();
            let mut outstanding = 0usize;
            let mut stopped = false;
            let mut terminated = false;

            let spawn_item = |item: I, done_tx: mpsc::Sender<()>, callback: Arc<F>| {
                tokio::spawn(async move {
                    callback(item).await;
                    let _ = done_tx.send(()).await;
                });
            };

            loop {
                tokio::select! {
                    biased;

                    Some(cmd) = command_rx.recv(), if !stopped => {
                        match cmd {
                            Command::AddBatch(items) => {
                                let mut items = items.into_iter();
                                while outstanding < max_tasks {
                                    match items.next() {
                                        Some(item) => {
                                            outstanding += 1;
                                            spawn_item(item, done_tx.clone(), callback.clone());
                                        }
                                        None => break,
                                    }
                                }
                                worklist.extend(items);
                            }
                            Command::Stop { terminate } => {
                                stopped = true;
                                terminated = terminate;
                                if terminate {
                                    worklist.clear();
                                    let _ = finished_tx.send(()).await;
                                    if outstanding == 0 {
                                        return;
                                    }
                                } else if worklist.is_empty() && outstanding == 0 {
                                    let _ = finished_tx.send(()).await;
                                    return;
                                }
                            }
                        }
                    }

                    Some(()) = done_rx.recv() => {
                        outstanding -= 1;
                        if let Some(item) = worklist.pop() {
                            outstanding += 1;
                            spawn_item(item, done_tx.clone(), callback.clone());
                            continue;
                        }
                        if stopped && worklist.is_empty() && outstanding == 0 {
                            if !terminated {
                                let _ = finished_tx.send(()).await;
                            }
                            return;
                        }
                    }

                    else => return,
                }
            }
        });

        BatchProcessor {
            command_tx,
            finished_rx: Some(finished_rx),
            coordinator: Some(coordinator),
        }
    }

    /// Adds a batch's items for processing. Blocks until the coordinator
    /// accepts it (it is always ready unless mid-stop).
    pub async fn add_batch<B: Batch<Item = I>>(&self, batch: B) {
        let _ = self
            .command_tx
            .send(Command::AddBatch(batch.into_items()))
            .await;
    }

    /// Signals that no more batches are incoming and waits for every
    /// already-queued item to be delivered to the callback.
    pub async fn finish(mut self) {
        let _ = self
            .command_tx
            .send(Command::Stop { terminate: false })
            .await;
        if let Some(mut rx) = self.finished_rx.take() {
            let _ = rx.recv().await;
        }
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.await;
        }
    }

    /// Stops accepting new items and returns as soon as the coordinator
    /// acknowledges, even if workers are still in flight. Up to
    /// `max_tasks` callbacks may still run after this returns.
    pub async fn terminate(mut self) {
        let _ = self
            .command_tx
            .send(Command::Stop { terminate: true })
            .await;
        if let Some(mut rx) = self.finished_rx.take() {
            let _ = rx.recv().await;
        }
        self.coordinator.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn finish_delivers_every_item_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let processor = BatchProcessor::new(
            move |_item: u32| {
                let count_clone = count_clone.clone();
                async move {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }
            },
            4,
        );

        processor
            .add_batch(vec![1u32, 2, 3, 4, 5, 6, 7, 8, 9, 10])
            .await;
        processor.finish().await;

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outstanding_never_exceeds_max_tasks() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let inflight_clone = inflight.clone();
        let max_seen_clone = max_seen.clone();

        let processor = BatchProcessor::new(
            move |_item: u32| {
                let inflight_clone = inflight_clone.clone();
                let max_seen_clone = max_seen_clone.clone();
                async move {
                    let now = inflight_clone.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen_clone.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inflight_clone.fetch_sub(1, Ordering::SeqCst);
                }
            },
            3,
        );

        processor.add_batch((0u32..30).collect::<Vec<_>>()).await;
        processor.finish().await;

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn terminate_returns_without_waiting_for_stragglers() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let processor = BatchProcessor::new(
            move |_item: u32| {
                let count_clone = count_clone.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }
            },
            2,
        );

        processor.add_batch(vec![1u32, 2, 3, 4, 5, 6]).await;
        let start = std::time::Instant::now();
        processor.terminate().await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }
}
