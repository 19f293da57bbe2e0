use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::EngineResult;
use crate::system::process::ProcessTree;
use crate::system::{SnapshotEngine, SystemSnapshot};

/// Drives an engine from a periodic timer and on-demand requests.
///
/// Cycles run on the blocking pool, one at a time. Requests arriving while a
/// cycle is in flight collapse into a single follow-up cycle, so a burst never
/// queues more than one extra snapshot.
pub struct RefreshDriver<T = SystemSnapshot> {
    trigger: Arc<Notify>,
    rx: mpsc::UnboundedReceiver<EngineResult<T>>,
    ticker: Option<JoinHandle<()>>,
    worker: JoinHandle<()>,
}

impl RefreshDriver {
    /// Start the worker; with `interval` set, also request a cycle on every
    /// tick, starting immediately.
    pub fn spawn(engine: Arc<SnapshotEngine>, interval: Option<Duration>) -> Self {
        Self::spawn_with(engine, interval, |_, snapshot| snapshot.clone())
    }
}

impl<T: Send + 'static> RefreshDriver<T> {
    /// Like [`RefreshDriver::spawn`], but each cycle yields `read` applied to
    /// the tree and snapshot of that same cycle, before the next can start.
    pub fn spawn_with<F>(
        engine: Arc<SnapshotEngine>,
        interval: Option<Duration>,
        read: F,
    ) -> Self
    where
        F: Fn(&ProcessTree, &SystemSnapshot) -> T + Send + Sync + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let read = Arc::new(read);

        let worker = {
            let trigger = Arc::clone(&trigger);
            tokio::spawn(async move {
                loop {
                    trigger.notified().await;
                    let engine = Arc::clone(&engine);
                    let read = Arc::clone(&read);
                    let cycle = tokio::task::spawn_blocking(move || {
                        engine.produce_snapshot_with(|tree, snapshot| (*read)(tree, snapshot))
                    });
                    let result = match cycle.await {
                        Ok(result) => result,
                        Err(err) => {
                            tracing::error!(error = %err, "snapshot cycle aborted");
                            break;
                        }
                    };
                    if let Err(err) = &result {
                        tracing::warn!(error = %err, "snapshot cycle failed, keeping previous state");
                    }
                    if tx.send(result).is_err() {
                        break;
                    }
                }
            })
        };

        let ticker = interval.map(|period| {
            let trigger = Arc::clone(&trigger);
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(period);
                loop {
                    ticks.tick().await;
                    trigger.notify_one();
                }
            })
        });

        Self {
            trigger,
            rx,
            ticker,
            worker,
        }
    }

    /// Ask for a cycle. Never blocks; coalesces with any pending request.
    pub fn request_refresh(&self) {
        self.trigger.notify_one();
    }

    /// Outcome of the next completed cycle, or `None` once the worker stops.
    pub async fn next(&mut self) -> Option<EngineResult<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for RefreshDriver<T> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::Config;
    use crate::error::SourceError;
    use crate::system::EngineParts;
    use crate::system::buffer::{ListingSource, QueryOutcome};
    use crate::system::layout::{ListingEntry, ListingWriter};
    use crate::system::metrics::{DiskBusySample, DriveInfo, MachineProbe, MemoryStatus};
    use crate::system::services::{ServiceMembership, ServiceSource};

    struct SlowListing {
        started: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl ListingSource for SlowListing {
        fn query(&mut self, buf: &mut [u8]) -> Result<QueryOutcome, SourceError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let mut writer = ListingWriter::new(buf);
            writer.push(&ListingEntry {
                pid: 4,
                create_time: 1,
                name: "init",
                ..Default::default()
            });
            Ok(writer.finish())
        }
    }

    struct NoServices;

    impl ServiceSource for NoServices {
        fn enumerate(&mut self) -> Result<ServiceMembership, SourceError> {
            Ok(ServiceMembership::new())
        }
    }

    struct NoProbe;

    impl MachineProbe for NoProbe {
        fn memory(&mut self) -> Result<MemoryStatus, SourceError> {
            Err(SourceError::Unsupported("memory"))
        }
        fn fixed_drives(&mut self) -> Result<Vec<DriveInfo>, SourceError> {
            Ok(Vec::new())
        }
        fn disk_busy(&mut self) -> Result<DiskBusySample, SourceError> {
            Err(SourceError::Unsupported("disk"))
        }
    }

    fn slow_engine(started: &Arc<AtomicUsize>, delay: Duration) -> Arc<SnapshotEngine> {
        let parts = EngineParts {
            listing: Box::new(SlowListing {
                started: Arc::clone(started),
                delay,
            }),
            services: Box::new(NoServices),
            probe: Box::new(NoProbe),
            logical_processors: 1,
        };
        Arc::new(SnapshotEngine::with_parts(&Config::default(), parts))
    }

    #[tokio::test]
    async fn single_request_runs_one_cycle() {
        let started = Arc::new(AtomicUsize::new(0));
        let engine = slow_engine(&started, Duration::from_millis(1));
        let mut driver = RefreshDriver::spawn(Arc::clone(&engine), None);

        driver.request_refresh();
        let snapshot = driver.next().await.expect("worker alive").expect("cycle ok");
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.process_count, 1);
        assert_eq!(engine.generation(), 1);
    }

    #[tokio::test]
    async fn burst_during_a_cycle_coalesces_into_one_more() {
        let started = Arc::new(AtomicUsize::new(0));
        let engine = slow_engine(&started, Duration::from_millis(200));
        let mut driver = RefreshDriver::spawn(Arc::clone(&engine), None);

        driver.request_refresh();
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..10 {
            driver.request_refresh();
        }

        let first = driver.next().await.expect("worker alive").expect("cycle ok");
        let second = driver.next().await.expect("worker alive").expect("cycle ok");
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);

        let extra = tokio::time::timeout(Duration::from_millis(400), driver.next()).await;
        assert!(extra.is_err(), "burst must not queue more than one cycle");
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reader_sees_the_tree_of_its_own_cycle() {
        let started = Arc::new(AtomicUsize::new(0));
        let engine = slow_engine(&started, Duration::from_millis(1));
        let mut driver = RefreshDriver::spawn_with(
            Arc::clone(&engine),
            Some(Duration::from_millis(20)),
            |tree, snapshot| (snapshot.generation, snapshot.process_count, tree.len()),
        );

        for expected in 1..=3 {
            let (generation, counted, in_tree) =
                driver.next().await.expect("worker alive").expect("cycle ok");
            assert_eq!(generation, expected);
            assert_eq!(counted, in_tree);
        }
    }

    #[tokio::test]
    async fn interval_ticks_drive_cycles() {
        let started = Arc::new(AtomicUsize::new(0));
        let engine = slow_engine(&started, Duration::from_millis(1));
        let mut driver = RefreshDriver::spawn(engine, Some(Duration::from_millis(20)));

        for expected in 1..=3 {
            let snapshot = driver.next().await.expect("worker alive").expect("cycle ok");
            assert_eq!(snapshot.generation, expected);
        }
    }
}
