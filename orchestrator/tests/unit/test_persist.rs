//! Debounced persistence tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use optimizerd::errors::OrchestratorError;
use optimizerd::jobs::persist::DebouncedPersister;
use optimizerd::jobs::store::Flush;

#[derive(Default)]
struct CountingFlush {
    writes: AtomicUsize,
}

impl CountingFlush {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Flush for CountingFlush {
    async fn flush(&self) -> Result<(), OrchestratorError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn persister(target: &Arc<CountingFlush>) -> DebouncedPersister {
    let flush: Arc<dyn Flush> = target.clone();
    DebouncedPersister::new(flush, Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn test_burst_for_one_job_is_one_write() {
    let target = Arc::new(CountingFlush::default());
    let persister = persister(&target);

    for _ in 0..5 {
        persister.schedule("job-a");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(target.writes(), 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(target.writes(), 1);
    assert_eq!(persister.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_are_debounced_independently() {
    let target = Arc::new(CountingFlush::default());
    let persister = persister(&target);

    persister.schedule("job-a");
    persister.schedule("job-b");
    persister.schedule("job-a");
    assert_eq!(persister.pending_count(), 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(target.writes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flush_now_supersedes_pending_write() {
    let target = Arc::new(CountingFlush::default());
    let persister = persister(&target);

    persister.schedule("job-a");
    tokio_test::assert_ok!(persister.flush_now("job-a").await);
    assert_eq!(target.writes(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(target.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_all_drains() {
    let target = Arc::new(CountingFlush::default());
    let persister = persister(&target);

    persister.schedule("job-a");
    persister.schedule("job-b");
    tokio_test::assert_ok!(persister.flush_all().await);
    assert_eq!(target.writes(), 1);
    assert_eq!(persister.pending_count(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(target.writes(), 1);
}
