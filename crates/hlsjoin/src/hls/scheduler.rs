// HLS Segment Scheduler: a fixed set of workers draining a bounded FIFO queue.

use crate::hls::HlsDownloaderError;
use crate::hls::config::DEFAULT_WORKER_COUNT;
use crate::hls::playlist::{KeyRef, SegmentDescriptor};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One unit of work: a segment plus the stream-wide default key.
#[derive(Debug, Clone)]
pub struct SegmentTask {
    pub index: usize,
    pub descriptor: SegmentDescriptor,
    pub default_key: Option<Arc<KeyRef>>,
}

impl SegmentTask {
    pub fn new(descriptor: SegmentDescriptor, default_key: Option<Arc<KeyRef>>) -> Self {
        Self {
            index: descriptor.index,
            descriptor,
            default_key,
        }
    }

    pub fn uri(&self) -> &str {
        &self.descriptor.uri
    }
}

pub struct WorkerPool<T> {
    worker_count: usize,
    task_tx: StdMutex<Option<mpsc::Sender<T>>>,
    task_rx: Arc<Mutex<mpsc::Receiver<T>>>,
    token: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// A zero worker count falls back to the default; a zero queue capacity
    /// means twice the worker count.
    pub fn new(worker_count: usize, queue_capacity: usize, token: CancellationToken) -> Self {
        let worker_count = if worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            worker_count
        };
        let queue_capacity = if queue_capacity == 0 {
            worker_count * 2
        } else {
            queue_capacity
        };
        let (task_tx, task_rx) = mpsc::channel(queue_capacity);
        Self {
            worker_count,
            task_tx: StdMutex::new(Some(task_tx)),
            task_rx: Arc::new(Mutex::new(task_rx)),
            token,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        match self.task_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Appends a task, waiting while the queue is full.
    pub async fn enqueue(&self, task: T) -> Result<(), HlsDownloaderError> {
        let sender = self.sender().ok_or_else(|| {
            HlsDownloaderError::InternalError("task queue is already closed".to_string())
        })?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HlsDownloaderError::Cancelled),
            sent = sender.send(task) => sent.map_err(|_| {
                HlsDownloaderError::InternalError("task queue receiver dropped".to_string())
            }),
        }
    }

    /// No more tasks will be enqueued. Workers finish what is queued, then exit.
    pub fn close_queue(&self) {
        let sender = match self.task_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_some() {
            debug!("Task queue closed");
        }
    }

    /// Runs `worker_count` workers until the queue is closed and drained or
    /// the token is cancelled. Each dequeued task is handed to `processor`
    /// exactly once; an in-flight task is dropped when the token fires.
    pub async fn run<F, Fut>(&self, processor: F) -> Result<(), HlsDownloaderError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let processor = Arc::new(processor);
        let mut join_set = JoinSet::new();

        info!(workers = self.worker_count, "Starting worker pool");
        for worker_id in 0..self.worker_count {
            let task_rx = Arc::clone(&self.task_rx);
            let token = self.token.clone();
            let processor = Arc::clone(&processor);

            join_set.spawn(async move {
                debug!(worker_id, "Worker started");
                loop {
                    let next = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = next else {
                        break;
                    };

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = processor(task) => {}
                    }
                }
                debug!(worker_id, "Worker exited");
            });
        }

        let mut outcome = Ok(());
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
                self.token.cancel();
                outcome = Err(HlsDownloaderError::InternalError(format!(
                    "worker task failed: {e}"
                )));
            }
        }
        debug!("All workers exited");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_task_processed_exactly_once() {
        let pool = Arc::new(WorkerPool::new(4, 0, CancellationToken::new()));
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let producer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for i in 0..50usize {
                    pool.enqueue(i).await.unwrap();
                }
                pool.close_queue();
            })
        };

        let seen_by_workers = Arc::clone(&seen);
        pool.run(move |i: usize| {
            let seen = Arc::clone(&seen_by_workers);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.lock().unwrap().push(i);
            }
        })
        .await
        .unwrap();
        producer.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        let distinct: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(distinct.len(), 50);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_worker_count() {
        let pool = Arc::new(WorkerPool::new(3, 0, CancellationToken::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let producer = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for i in 0..20usize {
                    pool.enqueue(i).await.unwrap();
                }
                pool.close_queue();
            })
        };

        let (active_w, peak_w) = (Arc::clone(&active), Arc::clone(&peak));
        pool.run(move |_: usize| {
            let active = Arc::clone(&active_w);
            let peak = Arc::clone(&peak_w);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        producer.await.unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn test_closed_empty_queue_finishes_immediately() {
        let pool: WorkerPool<usize> = WorkerPool::new(2, 0, CancellationToken::new());
        pool.close_queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_w = Arc::clone(&calls);
        pool.run(move |_| {
            let calls = Arc::clone(&calls_w);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pool.enqueue(1).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_stops_pending_tasks() {
        let token = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(1, 16, token.clone()));
        for i in 0..10usize {
            pool.enqueue(i).await.unwrap();
        }
        pool.close_queue();

        let started = Arc::new(AtomicUsize::new(0));
        let started_w = Arc::clone(&started);
        let cancel_token = token.clone();
        pool.run(move |i: usize| {
            let started = Arc::clone(&started_w);
            let token = cancel_token.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    token.cancel();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert!(matches!(
            pool.enqueue(99).await,
            Err(HlsDownloaderError::InternalError(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_on_full_queue_observes_cancellation() {
        let token = CancellationToken::new();
        let pool: WorkerPool<usize> = WorkerPool::new(1, 1, token.clone());
        pool.enqueue(0).await.unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        assert!(matches!(
            pool.enqueue(1).await,
            Err(HlsDownloaderError::Cancelled)
        ));
    }

    #[test]
    fn test_zero_worker_count_uses_default() {
        let pool: WorkerPool<usize> = WorkerPool::new(0, 0, CancellationToken::new());
        assert_eq!(pool.worker_count(), DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn test_segment_task_takes_descriptor_index() {
        let task = SegmentTask::new(SegmentDescriptor::new(7, "http://host/seg7.ts"), None);
        assert_eq!(task.index, 7);
        assert_eq!(task.uri(), "http://host/seg7.ts");
    }
}
