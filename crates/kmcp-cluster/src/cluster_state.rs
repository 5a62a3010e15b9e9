//! Discovery polling for API surface changes
//!
//! Installing an operator or enabling an add-on changes the set of API
//! groups a cluster serves, which in turn changes which tools make sense.
//! [`ClusterStateWatcher`] polls discovery, and once the surface has been
//! stable for a debounce window after a change, calls the reload callback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroupList;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kmcp_access::RestMapper;

use crate::clientset::AccessControlClientset;
use crate::debounce::{expired, Debouncer};
use crate::error::Result;
use crate::ReloadFn;

/// Default interval between discovery polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default quiet period before a detected change triggers a reload
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Environment override for the poll interval, in milliseconds
pub const POLL_INTERVAL_ENV: &str = "CLUSTER_STATE_POLL_INTERVAL_MS";

/// Environment override for the debounce window, in milliseconds
pub const DEBOUNCE_WINDOW_ENV: &str = "CLUSTER_STATE_DEBOUNCE_WINDOW_MS";

const OPENSHIFT_PROJECT_GROUP: &str = "project.openshift.io";

/// Snapshot of the parts of discovery that affect the tool surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// Served API group names, sorted
    pub api_groups: Vec<String>,
    /// Whether `project.openshift.io/v1` is served
    pub is_openshift: bool,
}

impl ClusterState {
    /// Build a snapshot from an `/apis` listing
    pub fn from_groups(list: &APIGroupList) -> Self {
        let mut api_groups: Vec<String> = list.groups.iter().map(|g| g.name.clone()).collect();
        api_groups.sort();
        let is_openshift = list.groups.iter().any(|g| {
            g.name == OPENSHIFT_PROJECT_GROUP && g.versions.iter().any(|v| v.version == "v1")
        });
        Self {
            api_groups,
            is_openshift,
        }
    }
}

/// Where cluster state snapshots come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterStateSource: Send + Sync {
    /// Take a fresh snapshot
    async fn capture(&self) -> Result<ClusterState>;

    /// Drop cached discovery so the next capture sees current data
    async fn invalidate(&self);
}

#[async_trait]
impl ClusterStateSource for AccessControlClientset {
    async fn capture(&self) -> Result<ClusterState> {
        let groups = self.client().list_api_groups().await?;
        Ok(ClusterState::from_groups(&groups))
    }

    async fn invalidate(&self) {
        self.mapper().reset().await;
    }
}

/// Poll and debounce timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Interval between polls
    pub poll_interval: Duration,
    /// Quiet period after the last detected change
    pub debounce_window: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
        }
    }
}

impl WatcherSettings {
    /// Defaults with the environment overrides applied
    pub fn from_env() -> Self {
        let poll = std::env::var(POLL_INTERVAL_ENV).ok();
        let debounce = std::env::var(DEBOUNCE_WINDOW_ENV).ok();
        Self::from_values(poll.as_deref(), debounce.as_deref())
    }

    /// Defaults with millisecond overrides; non-positive or malformed values are ignored
    pub fn from_values(poll_interval_ms: Option<&str>, debounce_window_ms: Option<&str>) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: positive_millis(poll_interval_ms).unwrap_or(defaults.poll_interval),
            debounce_window: positive_millis(debounce_window_ms)
                .unwrap_or(defaults.debounce_window),
        }
    }
}

fn positive_millis(value: Option<&str>) -> Option<Duration> {
    let millis = value?.trim().parse::<i64>().ok()?;
    u64::try_from(millis)
        .ok()
        .filter(|m| *m > 0)
        .map(Duration::from_millis)
}

/// Background poller that reloads after the API surface settles
///
/// [`close`](ClusterStateWatcher::close) stops the poll loop and waits for
/// it to exit. It may be called repeatedly, including on a watcher created
/// with [`Default`] that never started.
#[derive(Debug, Default)]
pub struct ClusterStateWatcher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterStateWatcher {
    /// Spawn the poll loop
    pub fn start(
        source: Arc<dyn ClusterStateSource>,
        settings: WatcherSettings,
        reload: ReloadFn,
    ) -> Self {
        Self::start_under(source, settings, reload, &CancellationToken::new())
    }

    /// Spawn the poll loop, stopping it as well when `parent` is cancelled
    pub fn start_under(
        source: Arc<dyn ClusterStateSource>,
        settings: WatcherSettings,
        reload: ReloadFn,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let task = tokio::spawn(run(source, settings, reload, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop polling and wait for the loop to finish
    pub async fn close(&self) {
        self.cancel.cancel();
        // held across the join so a concurrent close also waits for the exit
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Cluster state watcher task failed");
            }
        }
    }
}

async fn run(
    source: Arc<dyn ClusterStateSource>,
    settings: WatcherSettings,
    reload: ReloadFn,
    cancel: CancellationToken,
) {
    let initial = tokio::select! {
        _ = cancel.cancelled() => return,
        state = source.capture() => state.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to capture initial cluster state");
            ClusterState::default()
        }),
    };
    debug!(
        groups = initial.api_groups.len(),
        openshift = initial.is_openshift,
        "Captured initial cluster state"
    );

    // last_known reflects the most recent successful reload, last_seen the most recent poll
    let mut last_known = initial.clone();
    let mut last_seen = initial;
    let mut debouncer = Debouncer::new(settings.debounce_window);
    let mut ticker = interval_at(
        Instant::now() + settings.poll_interval,
        settings.poll_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                source.invalidate().await;
                let current = match source.capture().await {
                    Ok(state) => state,
                    Err(e) => {
                        debug!(error = %e, "Cluster state poll failed");
                        continue;
                    }
                };
                if current != last_seen {
                    debug!(groups = current.api_groups.len(), "Cluster state changed");
                    last_seen = current;
                    debouncer.trigger();
                } else if current != last_known && !debouncer.is_pending() {
                    debouncer.trigger();
                }
            }
            _ = expired(deadline) => {
                debouncer.cancel();
                info!("Cluster state settled, reloading");
                match reload().await {
                    Ok(()) => {
                        last_known = match source.capture().await {
                            Ok(state) => state,
                            Err(e) => {
                                debug!(
                                    error = %e,
                                    "Failed to recapture cluster state after reload"
                                );
                                last_seen.clone()
                            }
                        };
                        last_seen = last_known.clone();
                    }
                    Err(e) => warn!(error = %e, "Reload after cluster state change failed"),
                }
            }
        }
    }
    debug!("Cluster state watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reload_fn;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroup, GroupVersionForDiscovery};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(n: usize) -> ClusterState {
        ClusterState {
            api_groups: (0..n).map(|i| format!("group-{i}.example.com")).collect(),
            is_openshift: false,
        }
    }

    fn counting_reload(count: Arc<AtomicUsize>, fail_first: usize) -> ReloadFn {
        reload_fn(move || {
            let count = count.clone();
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(Error::Watcher("reload failed".to_string()))
                } else {
                    Ok(())
                }
            }
        })
    }

    /// Source whose state grows with each capture until `limit`
    fn growing_source(limit: usize) -> MockClusterStateSource {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut source = MockClusterStateSource::new();
        source.expect_invalidate().returning(|| ());
        source
            .expect_capture()
            .returning(move || Ok(state(calls.fetch_add(1, Ordering::SeqCst).min(limit))));
        source
    }

    fn fast() -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_secs(1),
            debounce_window: Duration::from_secs(5),
        }
    }

    #[test]
    fn snapshot_sorts_groups_and_detects_openshift() {
        let group = |name: &str, version: &str| APIGroup {
            name: name.to_string(),
            versions: vec![GroupVersionForDiscovery {
                group_version: format!("{name}/{version}"),
                version: version.to_string(),
            }],
            ..Default::default()
        };
        let list = APIGroupList {
            groups: vec![group("route.openshift.io", "v1"), group("apps", "v1")],
        };
        let plain = ClusterState::from_groups(&list);
        assert_eq!(plain.api_groups, vec!["apps", "route.openshift.io"]);
        assert!(!plain.is_openshift);

        let list = APIGroupList {
            groups: vec![group("project.openshift.io", "v1")],
        };
        assert!(ClusterState::from_groups(&list).is_openshift);

        let list = APIGroupList {
            groups: vec![group("project.openshift.io", "v2")],
        };
        assert!(!ClusterState::from_groups(&list).is_openshift);
    }

    #[test]
    fn settings_accept_only_positive_values() {
        let settings = WatcherSettings::from_values(Some("250"), Some("100"));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.debounce_window, Duration::from_millis(100));

        for bad in ["0", "-5", "soon", ""] {
            assert_eq!(
                WatcherSettings::from_values(Some(bad), Some(bad)),
                WatcherSettings::default()
            );
        }
        assert_eq!(WatcherSettings::from_values(None, None), WatcherSettings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stable_cluster_never_reloads() {
        let mut source = MockClusterStateSource::new();
        source.expect_invalidate().returning(|| ());
        source.expect_capture().returning(|| Ok(state(3)));
        let reloads = Arc::new(AtomicUsize::new(0));

        let watcher = ClusterStateWatcher::start(
            Arc::new(source),
            fast(),
            counting_reload(reloads.clone(), 0),
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        watcher.close().await;

        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_reloads_once() {
        let reloads = Arc::new(AtomicUsize::new(0));
        let watcher = ClusterStateWatcher::start(
            Arc::new(growing_source(4)),
            fast(),
            counting_reload(reloads.clone(), 0),
        );

        // Changes land on the first four ticks, one second apart
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        watcher.close().await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_is_retried() {
        let reloads = Arc::new(AtomicUsize::new(0));
        let watcher = ClusterStateWatcher::start(
            Arc::new(growing_source(1)),
            fast(),
            counting_reload(reloads.clone(), 1),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        watcher.close().await;
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_capture_is_not_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut source = MockClusterStateSource::new();
        source.expect_invalidate().returning(|| ());
        source.expect_capture().returning(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Watcher("discovery unavailable".to_string()))
            } else {
                Ok(ClusterState::default())
            }
        });
        let reloads = Arc::new(AtomicUsize::new(0));

        let watcher = ClusterStateWatcher::start(
            Arc::new(source),
            fast(),
            counting_reload(reloads.clone(), 0),
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        watcher.close().await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let idle = ClusterStateWatcher::default();
        idle.close().await;
        idle.close().await;

        let mut source = MockClusterStateSource::new();
        source.expect_invalidate().returning(|| ());
        source.expect_capture().returning(|| Ok(ClusterState::default()));
        let watcher = ClusterStateWatcher::start(
            Arc::new(source),
            WatcherSettings::default(),
            counting_reload(Arc::new(AtomicUsize::new(0)), 0),
        );
        watcher.close().await;
        watcher.close().await;
    }

    fn idle_source() -> Arc<MockClusterStateSource> {
        let mut source = MockClusterStateSource::new();
        source.expect_invalidate().returning(|| ());
        source.expect_capture().returning(|| Ok(ClusterState::default()));
        Arc::new(source)
    }

    #[tokio::test]
    async fn concurrent_close_waits_for_exit() {
        let source = idle_source();
        let watcher = Arc::new(ClusterStateWatcher::start(
            source.clone(),
            WatcherSettings::default(),
            counting_reload(Arc::new(AtomicUsize::new(0)), 0),
        ));

        let first = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.close().await }
        });
        tokio::task::yield_now().await;
        watcher.close().await;
        // the poll loop owned the only other reference to the source
        assert_eq!(Arc::strong_count(&source), 1);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_parent_stops_polling() {
        let source = idle_source();
        let parent = CancellationToken::new();
        let watcher = ClusterStateWatcher::start_under(
            source.clone(),
            WatcherSettings::default(),
            counting_reload(Arc::new(AtomicUsize::new(0)), 0),
            &parent,
        );

        drop(parent.clone().drop_guard());
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&source) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        watcher.close().await;
    }
}
