//! Filesystem watch over the kubeconfig files in use

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ReloadFn;

/// Environment variable holding the kubeconfig search list
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Kubeconfig files currently in the loading chain
///
/// An explicit path wins; otherwise every entry of `KUBECONFIG`, otherwise
/// `~/.kube/config`. Only files that exist are returned.
pub fn kubeconfig_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    resolve_paths(
        explicit,
        std::env::var_os(KUBECONFIG_ENV),
        dirs::home_dir(),
    )
}

/// [`kubeconfig_paths`] with the environment supplied by the caller
pub fn resolve_paths(
    explicit: Option<&Path>,
    kubeconfig_env: Option<OsString>,
    home: Option<PathBuf>,
) -> Vec<PathBuf> {
    let candidates: Vec<PathBuf> = match (explicit, kubeconfig_env) {
        (Some(path), _) => vec![path.to_path_buf()],
        (None, Some(list)) if !list.is_empty() => std::env::split_paths(&list)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
        _ => home
            .map(|h| vec![h.join(".kube").join("config")])
            .unwrap_or_default(),
    };

    let mut paths = Vec::new();
    for path in candidates {
        if path.is_file() && !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Whether a filesystem event should trigger a reload
pub fn is_reload_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    )
}

/// Active watch on a set of kubeconfig files
pub struct KubeconfigWatcher {
    _watcher: RecommendedWatcher,
    paths: Vec<PathBuf>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KubeconfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigWatcher")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl KubeconfigWatcher {
    /// Watch `paths`, calling `reload` after writes or renames
    ///
    /// Bursts of events that arrive while a reload is running are folded
    /// into a single follow-up reload. Reload errors are logged.
    pub fn start(paths: Vec<PathBuf>, reload: ReloadFn) -> Result<Self> {
        Self::start_under(paths, reload, &CancellationToken::new())
    }

    /// Like [`KubeconfigWatcher::start`], also stopping when `parent` is cancelled
    pub fn start_under(
        paths: Vec<PathBuf>,
        reload: ReloadFn,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if is_reload_event(&event.kind) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Kubeconfig watch error"),
            }
        })
        .map_err(|e| Error::Watcher(e.to_string()))?;

        for path in &paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| Error::Watcher(format!("{}: {e}", path.display())))?;
        }
        info!(files = paths.len(), "Watching kubeconfig files");

        let cancel = parent.child_token();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        while rx.try_recv().is_ok() {}
                        debug!("Kubeconfig changed, reloading");
                        if let Err(e) = reload().await {
                            warn!(error = %e, "Reload after kubeconfig change failed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            paths,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Files under watch
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Stop watching and wait for the dispatch task to exit
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Kubeconfig watcher task failed");
            }
        }
    }
}
