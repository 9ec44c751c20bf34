use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::{interval, MissedTickBehavior};

use super::{Inventory, Target};
use crate::{error::PurgeResult, filter::build_filter, filter::Criteria};

struct Snapshot {
    criteria: Criteria,
    targets: Vec<Target>,
}

/// Keeps the last successful lookup of the configured tags and refreshes it
/// in the background.
///
/// A describe for the cached criteria is answered from memory; anything else,
/// or any call before the first refresh completes, goes to the inner
/// inventory.
pub struct CachedInventory {
    inner: Arc<dyn Inventory>,
    tags: Vec<String>,
    refresh_interval: Duration,
    snapshot: ArcSwapOption<Snapshot>,
}

impl CachedInventory {
    pub fn new(inner: Arc<dyn Inventory>, tags: Vec<String>, refresh_interval: Duration) -> Self {
        Self {
            inner,
            tags,
            refresh_interval,
            snapshot: ArcSwapOption::empty(),
        }
    }

    /// Rebuilds the filter from the configured tags and swaps in a fresh
    /// target list. On failure the previous list stays in place.
    pub async fn refresh(&self) -> PurgeResult<usize> {
        let criteria = build_filter(&self.tags)?;
        let targets = self.inner.describe(&criteria).await?;
        let count = targets.len();
        self.snapshot.store(Some(Arc::new(Snapshot { criteria, targets })));
        Ok(count)
    }

    pub fn cached(&self) -> Option<Vec<Target>> {
        self.snapshot
            .load_full()
            .map(|snapshot| snapshot.targets.clone())
    }
}

#[async_trait]
impl Inventory for CachedInventory {
    async fn describe(&self, criteria: &Criteria) -> PurgeResult<Vec<Target>> {
        if let Some(snapshot) = self.snapshot.load_full() {
            if &snapshot.criteria == criteria {
                return Ok(snapshot.targets.clone());
            }
        }
        self.inner.describe(criteria).await
    }

    fn name(&self) -> &'static str {
        "cached"
    }
}

#[async_trait]
impl BackgroundService for CachedInventory {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping inventory refresh");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(count) => log::debug!(
                            "Refreshed {} inventory: {count} targets",
                            self.inner.name()
                        ),
                        Err(e) => log::error!(
                            "Inventory refresh from {} failed, keeping previous targets: {e}",
                            self.inner.name()
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::watch;

    use super::*;
    use crate::discovery::{tests::host, StaticInventory};
    use crate::error::PurgeError;

    /// Counts calls and fails on demand.
    struct Flaky {
        inner: StaticInventory,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Inventory for Flaky {
        async fn describe(&self, criteria: &Criteria) -> PurgeResult<Vec<Target>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PurgeError::Discovery("inventory unavailable".into()));
            }
            self.inner.describe(criteria).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn flaky() -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: StaticInventory::new(vec![
                host("10.0.0.1", 80, &[("env", "stage")]),
                host("10.0.0.2", 80, &[("env", "prod")]),
            ]),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn test_describe_falls_through_before_refresh() {
        let inner = flaky();
        let cache = CachedInventory::new(
            inner.clone(),
            vec!["env:stage".into()],
            Duration::from_secs(60),
        );
        assert!(cache.cached().is_none());

        let criteria = build_filter(&["env:stage"]).unwrap();
        let targets = cache.describe(&criteria).await.unwrap();
        assert_eq!(targets, vec![Target::new("10.0.0.1", 80)]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_describe_served_from_snapshot() {
        let inner = flaky();
        let cache = CachedInventory::new(
            inner.clone(),
            vec!["env:stage".into()],
            Duration::from_secs(60),
        );
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let criteria = build_filter(&["env:stage"]).unwrap();
        let targets = cache.describe(&criteria).await.unwrap();
        assert_eq!(targets, vec![Target::new("10.0.0.1", 80)]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // other criteria are never answered from the snapshot
        let criteria = build_filter(&["env:prod"]).unwrap();
        let targets = cache.describe(&criteria).await.unwrap();
        assert_eq!(targets, vec![Target::new("10.0.0.2", 80)]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_targets() {
        let inner = flaky();
        let cache = CachedInventory::new(
            inner.clone(),
            vec!["env:stage".into()],
            Duration::from_secs(60),
        );
        cache.refresh().await.unwrap();

        inner.failing.store(true, Ordering::SeqCst);
        assert!(matches!(cache.refresh().await, Err(PurgeError::Discovery(_))));
        assert_eq!(cache.cached(), Some(vec![Target::new("10.0.0.1", 80)]));
    }

    #[tokio::test]
    async fn test_refresh_rejects_invalid_tags() {
        let cache = CachedInventory::new(flaky(), vec!["envstage".into()], Duration::from_secs(60));
        match cache.refresh().await {
            Err(PurgeError::Filter(e)) => assert_eq!(e.raw(), "envstage"),
            other => panic!("expected filter error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_background_refresh_until_shutdown() {
        let inner = flaky();
        let cache = Arc::new(CachedInventory::new(
            inner.clone(),
            vec!["env:stage".into()],
            Duration::from_millis(20),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.start(shutdown_rx).await })
        };

        let populated = tokio::time::timeout(Duration::from_secs(2), async {
            while inner.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(populated.is_ok(), "refresh keeps ticking");
        assert_eq!(cache.cached(), Some(vec![Target::new("10.0.0.1", 80)]));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresh loop stops on shutdown")
            .unwrap();

        let calls = inner.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), calls);
    }
}
