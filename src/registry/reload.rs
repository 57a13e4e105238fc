//! Hot-reload coordinator: watches the resource trees, coalesces change
//! events within the configured debounce window, rebuilds the registry
//! snapshot, and swaps it atomically.

use crate::config::Config;
use crate::registry::{self, RegistryHandle};
use crate::surface::{SurfaceEvent, SurfaceEvents};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Messages driving the coordinator task
enum ReloadSignal {
    /// A filesystem change in one of the watched trees
    FsChange,
    /// An explicit reload request from system control
    Manual,
}

/// Handle for requesting reloads outside the watcher path
#[derive(Clone)]
pub struct ReloadRequester {
    tx: mpsc::UnboundedSender<ReloadSignal>,
}

impl ReloadRequester {
    /// Request a rebuild; coalesced with any pending filesystem events
    pub fn request_reload(&self) {
        let _ = self.tx.send(ReloadSignal::Manual);
    }
}

/// Spawn the hot-reload coordinator. Returns a requester for manual reloads.
/// The watcher itself lives inside the spawned task and stops on shutdown.
pub fn spawn(
    config: &Config,
    registries: RegistryHandle,
    events: SurfaceEvents,
    shutdown: CancellationToken,
) -> ReloadRequester {
    let (tx, rx) = mpsc::unbounded_channel();
    let requester = ReloadRequester { tx: tx.clone() };

    let debounce = Duration::from_millis(config.hot_reload.debounce_ms);
    let paths = config.resources.clone();

    tokio::spawn(async move {
        // The notify callback runs on the watcher's own thread; it only
        // forwards a signal into the coordinator channel.
        let watch_tx = tx.clone();
        let mut watcher: Option<RecommendedWatcher> = match notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| {
                if result.is_ok() {
                    let _ = watch_tx.send(ReloadSignal::FsChange);
                }
            },
        ) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!("file watcher unavailable, manual reload only: {}", err);
                None
            }
        };

        if let Some(watcher) = watcher.as_mut() {
            for dir in [
                &paths.prompts_dir,
                &paths.gates_dir,
                &paths.methodologies_dir,
            ] {
                watch_tree(watcher, dir);
            }
        }

        run_loop(rx, debounce, paths, registries, events, shutdown).await;
        drop(watcher);
    });

    requester
}

fn watch_tree(watcher: &mut RecommendedWatcher, dir: &Path) {
    if !dir.exists() {
        // Created later by a resource write; the manual reload path covers it
        return;
    }
    if let Err(err) = watcher.watch(dir, RecursiveMode::Recursive) {
        tracing::warn!("cannot watch {}: {}", dir.display(), err);
    }
}

async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<ReloadSignal>,
    debounce: Duration,
    paths: crate::config::ResourcePaths,
    registries: RegistryHandle,
    events: SurfaceEvents,
    shutdown: CancellationToken,
) {
    loop {
        // Block until the first signal of a batch
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            signal = rx.recv() => signal,
        };
        if first.is_none() {
            return;
        }

        // Coalesce everything arriving within the debounce window
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(debounce) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
            }
        }

        let snapshot = {
            let paths = paths.clone();
            // Parsing reads the filesystem; keep it off the async workers
            match tokio::task::spawn_blocking(move || registry::load_snapshot(&paths)).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!("registry rebuild task failed: {}", err);
                    continue;
                }
            }
        };

        let issue_count = snapshot.issues.len();
        registries.install(snapshot);
        events.publish(SurfaceEvent::RegistryChanged);
        tracing::info!(
            "registry snapshot swapped ({} file issues recorded)",
            issue_count
        );
    }
}
