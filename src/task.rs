//! Clean and build tasks for one asset class.
//!
//! A task is identified by `(class, phase)` and holds no state between runs:
//! everything it needs lives in the [`TaskContext`] it is run against.
//!
//! ```text
//! clean  <dest>/<clean glob>              removed, absent files are fine
//! build  <source glob> → convert → <dest>/<path below glob base>[.ext]
//! ```
//!
//! A build stops at the first failing input. Outputs already written for
//! earlier inputs stay on disk; the next clean of the class removes them.
//! Empty source matches are a successful no-op.

use crate::config::PipelineConfig;
use crate::convert::{self, ConvertError, Converter, bem};
use crate::paths::{self, PathsError};
use crate::serve::DevServer;
use crate::types::{AssetClass, Phase, TaskId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{class}: cannot read sources: {cause}")]
    Source {
        class: AssetClass,
        #[source]
        cause: PathsError,
    },
    #[error("{class}: failed to convert {}: {cause}", .input.display())]
    Converter {
        class: AssetClass,
        input: PathBuf,
        #[source]
        cause: ConvertError,
    },
    #[error("{class}: failed to write {}: {cause}", .output.display())]
    Write {
        class: AssetClass,
        output: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("{class}: failed to remove {}: {cause}", .path.display())]
    Clean {
        class: AssetClass,
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to purge {}: {cause}", .path.display())]
    Purge {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
}

impl TaskError {
    /// The asset class whose task failed, if the failure belongs to one.
    pub fn class(&self) -> Option<AssetClass> {
        match self {
            Self::Source { class, .. }
            | Self::Converter { class, .. }
            | Self::Write { class, .. }
            | Self::Clean { class, .. } => Some(*class),
            Self::Purge { .. } => None,
        }
    }
}

/// Outcome of one successful task run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    /// Files removed (clean) or written (build).
    pub files: usize,
    pub started: Instant,
    pub finished: Instant,
    /// Converter summary line, e.g. image cache statistics.
    pub summary: Option<String>,
    pub warnings: Vec<String>,
}

impl TaskReport {
    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

/// Progress events for the CLI printer.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Purged { path: PathBuf },
    /// Emitted right before a task touches the filesystem.
    Started { id: TaskId },
    Finished(TaskReport),
    Failed { id: TaskId, error: String },
    /// A watched file changed and triggered a cycle for `class`.
    Changed { class: AssetClass, path: PathBuf },
}

/// Everything a task needs to run: project location, configuration, one
/// converter per class, and the optional dev server and event sink.
pub struct TaskContext {
    project_root: PathBuf,
    config: PipelineConfig,
    converters: HashMap<AssetClass, Arc<dyn Converter>>,
    server: Option<Arc<dyn DevServer>>,
    events: Option<Sender<TaskEvent>>,
}

impl TaskContext {
    /// Context with the converters described by `config`.
    pub fn new(project_root: impl Into<PathBuf>, config: PipelineConfig, use_cache: bool) -> Self {
        let project_root = project_root.into();
        let converters = AssetClass::ALL
            .into_iter()
            .map(|class| {
                let converter: Arc<dyn Converter> = Arc::from(convert::from_config(
                    &config.class(class).converter,
                    &config,
                    &project_root,
                    use_cache,
                ));
                (class, converter)
            })
            .collect();
        Self {
            project_root,
            config,
            converters,
            server: None,
            events: None,
        }
    }

    /// Replace the converter of one class.
    pub fn with_converter(mut self, class: AssetClass, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(class, converter);
        self
    }

    pub fn with_server(mut self, server: Arc<dyn DevServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_events(mut self, events: Sender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn server(&self) -> Option<&Arc<dyn DevServer>> {
        self.server.as_ref()
    }

    pub fn output_root(&self) -> PathBuf {
        self.config.output_root(&self.project_root)
    }

    fn converter(&self, class: AssetClass) -> &dyn Converter {
        // Every class gets a converter in `new`, so the map is total.
        self.converters[&class].as_ref()
    }

    /// Send an event to the printer, if one is listening.
    pub fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.events {
            // A closed channel only means nobody prints progress anymore.
            let _ = tx.send(event);
        }
    }
}

/// A clean or build unit for one asset class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn run(&self, ctx: &TaskContext) -> Result<TaskReport, TaskError> {
        let started = Instant::now();
        let mut report = match self.id.phase {
            Phase::Clean => clean(ctx, self.id.class)?,
            Phase::Build => build(ctx, self.id.class)?,
        };
        report.started = started;
        report.finished = Instant::now();
        info!(task = %self.id, files = report.files, elapsed = ?report.elapsed(), "task finished");
        Ok(report)
    }
}

fn empty_report(id: TaskId) -> TaskReport {
    let now = Instant::now();
    TaskReport {
        id,
        files: 0,
        started: now,
        finished: now,
        summary: None,
        warnings: Vec::new(),
    }
}

/// Remove the outputs matched by the class's clean glob.
fn clean(ctx: &TaskContext, class: AssetClass) -> Result<TaskReport, TaskError> {
    let mut report = empty_report(TaskId::clean(class));
    let dest = ctx.config.dest_dir(&ctx.project_root, class);
    if !dest.exists() {
        return Ok(report);
    }

    let mut targets = paths::expand_all(&dest, &ctx.config.class(class).clean)
        .map_err(|cause| TaskError::Source { class, cause })?;
    // Children sort after their parents; remove them first.
    targets.reverse();

    let clean_err = |path: &Path, cause: io::Error| TaskError::Clean {
        class,
        path: path.to_path_buf(),
        cause,
    };
    for target in &targets {
        let removed = if target.is_dir() {
            let files = WalkDir::new(target)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count();
            ignore_missing(std::fs::remove_dir_all(target)).map(|_| files)
        } else {
            ignore_missing(std::fs::remove_file(target)).map(usize::from)
        };
        report.files += removed.map_err(|e| clean_err(target, e))?;
        debug!(class = %class, path = %target.display(), "removed");
    }
    Ok(report)
}

/// `Ok(true)` when something was removed, `Ok(false)` when it was already gone.
fn ignore_missing(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Convert every source of the class into its destination.
fn build(ctx: &TaskContext, class: AssetClass) -> Result<TaskReport, TaskError> {
    let mut report = empty_report(TaskId::build(class));
    let cfg = ctx.config.class(class);
    let root = &ctx.project_root;

    let inputs = paths::expand_files(root, &cfg.source, &cfg.extensions)
        .map_err(|cause| TaskError::Source { class, cause })?;
    if inputs.is_empty() {
        debug!(class = %class, pattern = %cfg.source, "no sources");
    }

    let converter = ctx.converter(class);
    let base = root.join(paths::glob_base(&cfg.source));
    let dest = ctx.config.dest_dir(root, class);
    let extension = converter.output_extension();

    let convert_one = |input: &PathBuf| -> Result<PathBuf, TaskError> {
        let bytes = converter
            .convert(input)
            .map_err(|cause| TaskError::Converter {
                class,
                input: input.clone(),
                cause,
            })?;
        let output = paths::output_path(&base, input, &dest, extension);
        write_output(&output, &bytes).map_err(|cause| TaskError::Write {
            class,
            output: output.clone(),
            cause,
        })?;
        debug!(class = %class, input = %input.display(), output = %output.display(), "built");
        Ok(output)
    };

    let outputs: Vec<PathBuf> = if cfg.parallel {
        inputs
            .par_iter()
            .map(convert_one)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            outputs.push(convert_one(input)?);
        }
        outputs
    };
    report.files = outputs.len();

    if cfg.validate_bem {
        report.warnings.extend(check_bem(root, &outputs));
    }
    match converter.finish() {
        Ok(summary) => report.summary = summary,
        Err(e) => {
            warn!(class = %class, error = %e, "converter cleanup failed");
            report.warnings.push(e.to_string());
        }
    }

    if cfg.reload
        && let Some(server) = &ctx.server
    {
        server.notify(class);
    }
    Ok(report)
}

fn write_output(output: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, bytes)
}

/// BEM issues of written HTML, one line per issue.
fn check_bem(root: &Path, outputs: &[PathBuf]) -> Vec<String> {
    let mut warnings = Vec::new();
    for output in outputs {
        let Ok(html) = std::fs::read_to_string(output) else {
            continue;
        };
        let shown = output.strip_prefix(root).unwrap_or(output);
        for issue in bem::validate(&html) {
            warn!(file = %shown.display(), "BEM: {issue}");
            warnings.push(format!("{}: {issue}", shown.display()));
        }
    }
    warnings
}

/// Remove the whole output root. A missing root is not an error.
pub fn purge_output(output_root: &Path) -> Result<bool, TaskError> {
    let removed =
        ignore_missing(std::fs::remove_dir_all(output_root)).map_err(|cause| TaskError::Purge {
            path: output_root.to_path_buf(),
            cause,
        })?;
    if removed {
        info!(path = %output_root.display(), "purged output");
    }
    Ok(removed)
}
