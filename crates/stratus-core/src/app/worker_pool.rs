//! WorkerPool - 固定数の worker で upload を並列実行する
//!
//! submit された future は共有 channel に積まれ、空いている worker が取り出して
//! 実行する。同時実行数は worker 数で頭打ちになる。
//!
//! # 設計原則
//! - item ごとに `tokio::spawn` するので、panic はその item だけで止まる（`PoolError::Lost`）
//! - `submit_batch` は barrier: 全 item の結果が揃うまで返らない
//! - shutdown は sender を閉じるだけ。積まれている item は worker が drain してから抜ける

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PoolError;

type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool handle.
pub struct WorkerPool {
    size: usize,
    tx: Mutex<Option<mpsc::Sender<Work>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Work>(size * 4);
        let rx = Arc::new(AsyncMutex::new(rx));

        let joins = (0..size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(worker_id, rx))
            })
            .collect();

        debug!(workers = size, "worker pool started");
        Self {
            size,
            tx: Mutex::new(Some(tx)),
            joins: Mutex::new(joins),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run every item on the pool and wait for all of them.
    ///
    /// Results come back in submission order.
    pub async fn submit_batch<T, Fut>(&self, items: Vec<Fut>) -> Vec<Result<T, PoolError>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let Some(tx) = lock(&self.tx).clone() else {
            return items.into_iter().map(|_| Err(PoolError::Closed)).collect();
        };

        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            let (done_tx, done_rx) = oneshot::channel();
            let work: Work = Box::pin(async move {
                // receiver が先に消えていても気にしない
                let _ = done_tx.send(item.await);
            });
            match tx.send(work).await {
                Ok(()) => pending.push(Some(done_rx)),
                Err(_) => pending.push(None),
            }
        }
        drop(tx);

        let mut results = Vec::with_capacity(pending.len());
        for done_rx in pending {
            let result = match done_rx {
                None => Err(PoolError::Closed),
                Some(rx) => rx.await.map_err(|_| PoolError::Lost),
            };
            results.push(result);
        }
        results
    }

    /// Stop accepting work. Queued items still run.
    pub fn request_shutdown(&self) {
        lock(&self.tx).take();
    }

    /// Shutdown and wait for all workers to drain and exit.
    pub async fn shutdown_and_join(&self) {
        self.request_shutdown();
        let joins = std::mem::take(&mut *lock(&self.joins));
        for j in joins {
            if let Err(e) = j.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }
        debug!("worker pool stopped");
    }
}

/// `available_parallelism`, falling back to 1.
pub fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

async fn worker_loop(worker_id: usize, rx: Arc<AsyncMutex<mpsc::Receiver<Work>>>) {
    loop {
        // 受信中だけ lock を持つ。実行は lock の外
        let next = rx.lock().await.recv().await;
        let Some(work) = next else {
            break;
        };

        if let Err(e) = tokio::spawn(work).await {
            if e.is_panic() {
                warn!(worker_id, "work item panicked");
            } else {
                warn!(worker_id, error = %e, "work item cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_come_back_in_order() {
        let pool = WorkerPool::new(3);
        let items: Vec<_> = (0..10u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(10 * (10 - i))).await;
                i * 2
            })
            .collect();

        let results = pool.submit_batch(items).await;

        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        pool.shutdown_and_join().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_size() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<_> = (0..8)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        let results = pool.submit_batch(items).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        pool.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn panicking_item_is_reported_as_lost() {
        let pool = WorkerPool::new(2);
        let items: Vec<Pin<Box<dyn Future<Output = u32> + Send>>> = vec![
            Box::pin(async { 1 }),
            Box::pin(async { panic!("bad folder") }),
            Box::pin(async { 3 }),
        ];

        let results = pool.submit_batch(items).await;

        assert!(matches!(results[0], Ok(1)));
        assert!(matches!(results[1], Err(PoolError::Lost)));
        assert!(matches!(results[2], Ok(3)));

        // pool is still usable
        let again = pool.submit_batch(vec![async { 4u32 }]).await;
        assert!(matches!(again[0], Ok(4)));
        pool.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_closed() {
        let pool = WorkerPool::new(1);
        pool.shutdown_and_join().await;

        let results = pool.submit_batch(vec![async { 1u8 }]).await;
        assert!(matches!(results[0], Err(PoolError::Closed)));
    }

    #[test]
    fn zero_size_still_gets_one_worker() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let pool = WorkerPool::new(0);
            assert_eq!(pool.size(), 1);
            pool.shutdown_and_join().await;
        });
        assert!(default_size() >= 1);
    }
}
