//! Change detection and per-class rebuild scheduling for `dev`.
//!
//! ```text
//! notify ──debounce──▶ FileWatcher ──path──▶ Dispatcher
//!                                              │ match watch globs
//!                                              ▼
//!                         one worker thread per class, mpsc queue each
//!                         worker: recv → drain queue → clean + build → idle
//! ```
//!
//! Each class has exactly one worker, so two cycles of the same class never
//! overlap and a clean can never race its own build. Paths that arrive while
//! a class is rebuilding queue up and are coalesced into a single follow-up
//! cycle. Different classes rebuild concurrently.
//!
//! A failed cycle is logged and pushed to the dev server as a build error;
//! the worker then goes back to waiting.

use crate::paths;
use crate::pipeline::{Pipeline, Runner};
use crate::task::{TaskContext, TaskEvent};
use crate::types::AssetClass;
use glob::Pattern;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid watch glob for {class} '{pattern}': {source}")]
    Pattern {
        class: AssetClass,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to start watch worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to watch {}: {source}", .path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// A watch glob and the task sequence its changes trigger.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pub class: AssetClass,
    pub pattern: Pattern,
    pub pipeline: Pipeline,
}

impl WatchBinding {
    /// One binding per class, from the class's watch glob.
    pub fn from_context(ctx: &TaskContext) -> Result<Vec<Self>, WatchError> {
        AssetClass::ALL
            .into_iter()
            .map(|class| {
                let glob = ctx.config().class(class).watch_pattern();
                let pattern = Pattern::new(glob).map_err(|source| WatchError::Pattern {
                    class,
                    pattern: glob.to_string(),
                    source,
                })?;
                Ok(Self {
                    class,
                    pattern,
                    pipeline: Pipeline::for_class(class),
                })
            })
            .collect()
    }
}

/// Paths queued but not yet covered by a finished cycle, plus cycle counts.
#[derive(Default)]
struct Progress {
    pending: usize,
    cycles: HashMap<AssetClass, usize>,
}

#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    idle: Condvar,
}

impl Shared {
    fn queued(&self) {
        if let Ok(mut p) = self.progress.lock() {
            p.pending += 1;
        }
    }

    fn unqueued(&self) {
        if let Ok(mut p) = self.progress.lock() {
            p.pending = p.pending.saturating_sub(1);
            if p.pending == 0 {
                self.idle.notify_all();
            }
        }
    }

    fn cycle_done(&self, class: AssetClass, covered: usize) {
        if let Ok(mut p) = self.progress.lock() {
            p.pending = p.pending.saturating_sub(covered);
            *p.cycles.entry(class).or_default() += 1;
            if p.pending == 0 {
                self.idle.notify_all();
            }
        }
    }
}

/// Routes changed paths to per-class workers.
pub struct Dispatcher {
    root: PathBuf,
    bindings: Vec<(AssetClass, Pattern)>,
    queues: HashMap<AssetClass, Sender<PathBuf>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawn one worker per class. Workers run until the dispatcher drops.
    pub fn new(ctx: Arc<TaskContext>) -> Result<Self, WatchError> {
        let root = ctx
            .project_root()
            .canonicalize()
            .unwrap_or_else(|_| ctx.project_root().to_path_buf());
        let shared = Arc::new(Shared::default());
        let mut bindings = Vec::new();
        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for binding in WatchBinding::from_context(&ctx)? {
            let (tx, rx) = mpsc::channel();
            bindings.push((binding.class, binding.pattern.clone()));
            queues.insert(binding.class, tx);

            let ctx = Arc::clone(&ctx);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("watch-{}", binding.class))
                .spawn(move || worker(binding, ctx, rx, shared))
                .map_err(WatchError::Spawn)?;
            workers.push(handle);
        }

        Ok(Self {
            root,
            bindings,
            queues,
            workers,
            shared,
        })
    }

    /// Queue a rebuild for every class whose watch glob matches `path`.
    /// Returns the matched classes.
    pub fn dispatch(&self, path: &Path) -> Vec<AssetClass> {
        let relative = match path.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) if path.is_relative() => path,
            Err(_) => return Vec::new(),
        };

        let mut matched = Vec::new();
        for (class, pattern) in &self.bindings {
            if !paths::matches(pattern, relative) {
                continue;
            }
            if let Some(tx) = self.queues.get(class) {
                self.shared.queued();
                if tx.send(path.to_path_buf()).is_ok() {
                    matched.push(*class);
                } else {
                    self.shared.unqueued();
                }
            }
        }
        if !matched.is_empty() {
            debug!(path = %relative.display(), classes = ?matched, "dispatched");
        }
        matched
    }

    /// Block until every dispatched path has been covered by a finished
    /// cycle, or `timeout` elapses. Returns whether the dispatcher is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut progress) = self.shared.progress.lock() else {
            return false;
        };
        while progress.pending > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            progress = match self.shared.idle.wait_timeout(progress, left) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }

    /// Completed cycles of `class` so far.
    pub fn cycles(&self, class: AssetClass) -> usize {
        self.shared
            .progress
            .lock()
            .map(|p| p.cycles.get(&class).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the queues ends the worker loops.
        self.queues.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker(
    binding: WatchBinding,
    ctx: Arc<TaskContext>,
    rx: Receiver<PathBuf>,
    shared: Arc<Shared>,
) {
    while let Ok(first) = rx.recv() {
        let mut covered = 1;
        while rx.try_recv().is_ok() {
            covered += 1;
        }
        if covered > 1 {
            debug!(class = %binding.class, coalesced = covered, "coalesced changes");
        }

        ctx.emit(TaskEvent::Changed {
            class: binding.class,
            path: first,
        });
        if let Err(e) = Runner::new(&ctx).run(&binding.pipeline) {
            warn!(class = %binding.class, error = %e, "rebuild failed");
            if let Some(server) = ctx.server() {
                server.report_error(&e.to_string());
            }
        }
        shared.cycle_done(binding.class, covered);
    }
}

/// Filesystem watcher feeding a [`Dispatcher`].
///
/// Watching stops when this value drops.
pub struct FileWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl FileWatcher {
    /// Watch `root` recursively, dispatching every debounced change.
    pub fn new(
        root: &Path,
        debounce: Duration,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, WatchError> {
        let mut debouncer = new_debouncer(
            debounce,
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(events) => {
                    for event in events {
                        dispatcher.dispatch(&event.path);
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            },
        )
        .map_err(|source| WatchError::Notify {
            path: root.to_path_buf(),
            source,
        })?;

        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Notify {
                path: root.to_path_buf(),
                source,
            })?;

        info!(
            path = %root.display(),
            debounce_ms = debounce.as_millis() as u64,
            "watching for changes"
        );
        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::MockConverter;
    use crate::convert::{ConvertError, Converter};
    use crate::test_helpers::*;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn bindings_use_watch_globs() {
        let project = TestProject::new();
        let ctx = project.mock_context();
        let bindings = WatchBinding::from_context(&ctx).unwrap();
        let styles = bindings.iter().find(|b| b.class == AssetClass::Styles).unwrap();
        assert_eq!(styles.pattern.as_str(), "src/**/*.scss");
        assert_eq!(styles.pipeline, Pipeline::for_class(AssetClass::Styles));
    }

    #[test]
    fn partial_change_rebuilds_styles_only() {
        let project = TestProject::with_every_class();
        let server = Arc::new(RecordingServer::default());
        let ctx = Arc::new(project.mock_context().with_server(server.clone()));
        let dispatcher = Dispatcher::new(ctx).unwrap();

        project.write("src/partials/_buttons.scss", "b");
        let matched = dispatcher.dispatch(&project.path("src/partials/_buttons.scss"));
        assert_eq!(matched, vec![AssetClass::Styles]);
        assert!(dispatcher.wait_idle(WAIT));

        for class in AssetClass::ALL {
            let expected = usize::from(class == AssetClass::Styles);
            assert_eq!(dispatcher.cycles(class), expected, "{class}");
        }
        assert_eq!(server.notified(), vec![AssetClass::Styles]);
        assert!(project.path("dist/css/style.scss").exists());
    }

    #[test]
    fn unrelated_and_outside_paths_are_ignored() {
        let project = TestProject::new();
        let dispatcher = Dispatcher::new(Arc::new(project.mock_context())).unwrap();

        assert!(dispatcher.dispatch(&project.path("README.md")).is_empty());
        assert!(dispatcher.dispatch(&project.path("dist/css/style.css")).is_empty());
        assert!(dispatcher.dispatch(Path::new("/elsewhere/src/style.scss")).is_empty());
        assert!(dispatcher.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn relative_paths_are_project_relative() {
        let project = TestProject::new();
        let dispatcher = Dispatcher::new(Arc::new(project.mock_context())).unwrap();
        assert_eq!(dispatcher.dispatch(Path::new("src/app.js")), vec![AssetClass::Scripts]);
        assert!(dispatcher.wait_idle(WAIT));
    }

    /// Sleeps inside `convert` and records how many calls overlap.
    #[derive(Default)]
    struct SlowConverter {
        active: Mutex<usize>,
        max_active: Mutex<usize>,
    }

    impl Converter for SlowConverter {
        fn name(&self) -> &str {
            "slow"
        }

        fn output_extension(&self) -> Option<&str> {
            None
        }

        fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError> {
            {
                let mut active = self.active.lock().unwrap();
                *active += 1;
                let mut max = self.max_active.lock().unwrap();
                *max = (*max).max(*active);
            }
            std::thread::sleep(Duration::from_millis(50));
            *self.active.lock().unwrap() -= 1;
            Ok(std::fs::read(input).unwrap_or_default())
        }
    }

    #[test]
    fn burst_during_a_slow_cycle_is_coalesced_and_never_overlaps() {
        let project = TestProject::with_every_class();
        let slow = Arc::new(SlowConverter::default());
        let ctx = project
            .mock_context()
            .with_converter(AssetClass::Styles, slow.clone());
        let dispatcher = Dispatcher::new(Arc::new(ctx)).unwrap();

        let path = project.path("src/style.scss");
        for _ in 0..20 {
            dispatcher.dispatch(&path);
        }
        assert!(dispatcher.wait_idle(WAIT));

        // The first cycle starts at once; everything queued behind its
        // 50ms convert drains into one follow-up.
        let cycles = dispatcher.cycles(AssetClass::Styles);
        assert!((1..=3).contains(&cycles), "{cycles} cycles for 20 changes");
        assert_eq!(*slow.max_active.lock().unwrap(), 1);
        assert_eq!(*slow.active.lock().unwrap(), 0);
    }

    #[test]
    fn failed_cycle_is_reported_and_worker_survives() {
        let project = TestProject::with_every_class();
        let server = Arc::new(RecordingServer::default());
        let ctx = project
            .mock_context()
            .with_server(server.clone())
            .with_converter(
                AssetClass::Scripts,
                Arc::new(MockConverter::new().failing_on("app.js")),
            );
        let dispatcher = Dispatcher::new(Arc::new(ctx)).unwrap();

        dispatcher.dispatch(&project.path("src/app.js"));
        assert!(dispatcher.wait_idle(WAIT));
        assert_eq!(server.errors().len(), 1);
        assert!(server.errors()[0].starts_with("scripts:"), "{:?}", server.errors());

        dispatcher.dispatch(&project.path("src/app.js"));
        assert!(dispatcher.wait_idle(WAIT));
        assert_eq!(dispatcher.cycles(AssetClass::Scripts), 2);
        assert!(server.notified().is_empty());
    }
}
