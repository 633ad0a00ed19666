use std::future::Future;
use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Run `work` over `items` with `workers` tasks pulling from one closed queue.
///
/// Results come back in completion order. Each item is handed to exactly one
/// worker; the queue is filled and closed before any worker starts.
pub(crate) async fn run_pool<I, O, F, Fut>(items: Vec<I>, workers: usize, work: F) -> Vec<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send,
{
    if items.is_empty() {
        return Vec::new();
    }

    let worker_count = workers.clamp(1, items.len());
    let (job_tx, job_rx) = mpsc::channel(items.len());
    for item in items {
        if job_tx.send(item).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let work = Arc::new(work);

    let mut tasks = JoinSet::new();
    for _ in 0..worker_count {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let work = Arc::clone(&work);
        tasks.spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some(item) = next else { break };
                if result_tx.send(work(item).await).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Worker task failed: {}", e);
        }
    }

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_item_processed_once() {
        for workers in [1, 5, 20] {
            let mut results = run_pool((0..50).collect(), workers, |n: u32| async move { n * 2 }).await;
            results.sort_unstable();
            assert_eq!(results, (0..50).map(|n| n * 2).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_worker_count_bounds_parallelism() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let results = run_pool((0..20).collect::<Vec<u32>>(), 3, move |_| {
            let (in_flight, peak) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results: Vec<u32> = run_pool(Vec::<u32>::new(), 5, |n| async move { n }).await;
        assert!(results.is_empty());
    }
}
