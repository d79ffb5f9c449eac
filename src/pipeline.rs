//! Ordered task sequences and the runner that executes them.
//!
//! A pipeline is data: an explicit list of steps, not a chain of calls.
//! That makes the ordering checkable before anything runs.
//!
//! ```text
//! dev / prod   purge → fonts clean → fonts build → files clean → … → styles build
//! for_class(X) X clean → X build                      (one watch cycle)
//! ```
//!
//! `dev` and `prod` share the same startup sequence; what differs is what
//! the caller does after it succeeds.

use crate::task::{Task, TaskContext, TaskError, TaskEvent, TaskReport, purge_output};
use crate::types::{AssetClass, Phase, TaskId};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

/// One step of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Remove the whole output root.
    Purge,
    Task(TaskId),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("'{task}' runs without a preceding '{} clean'", .task.class)]
pub struct OrderError {
    pub task: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
}

impl Pipeline {
    /// Purge, then clean and build every class in declaration order.
    fn startup(name: &str) -> Self {
        let mut steps = vec![Step::Purge];
        for class in AssetClass::ALL {
            steps.push(Step::Task(TaskId::clean(class)));
            steps.push(Step::Task(TaskId::build(class)));
        }
        Self {
            name: name.to_string(),
            steps,
        }
    }

    pub fn dev() -> Self {
        Self::startup("dev")
    }

    pub fn prod() -> Self {
        Self::startup("prod")
    }

    /// Clean then build a single class: the sequence a watch cycle runs.
    pub fn for_class(class: AssetClass) -> Self {
        Self {
            name: class.name().to_string(),
            steps: vec![
                Step::Task(TaskId::clean(class)),
                Step::Task(TaskId::build(class)),
            ],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            Step::Task(id) => Some(*id),
            Step::Purge => None,
        })
    }

    /// Every build must follow a clean of its class that no earlier build of
    /// the same class has consumed.
    pub fn validate(&self) -> Result<(), OrderError> {
        let mut cleaned: HashSet<AssetClass> = HashSet::new();
        for id in self.task_ids() {
            match id.phase {
                Phase::Clean => {
                    cleaned.insert(id.class);
                }
                Phase::Build => {
                    if !cleaned.remove(&id.class) {
                        return Err(OrderError { task: id });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Executes pipelines strictly in order, stopping at the first failure.
///
/// Nothing is rolled back: output of steps that already finished stays on
/// disk.
pub struct Runner<'a> {
    ctx: &'a TaskContext,
}

impl<'a> Runner<'a> {
    pub fn new(ctx: &'a TaskContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, pipeline: &Pipeline) -> Result<Vec<TaskReport>, TaskError> {
        debug_assert!(pipeline.validate().is_ok(), "{:?}", pipeline.validate());
        info!(pipeline = pipeline.name(), steps = pipeline.steps().len(), "running pipeline");

        let mut reports = Vec::new();
        for step in pipeline.steps() {
            match *step {
                Step::Purge => {
                    let root = self.ctx.output_root();
                    purge_output(&root)?;
                    self.ctx.emit(TaskEvent::Purged { path: root });
                }
                Step::Task(id) => {
                    self.ctx.emit(TaskEvent::Started { id });
                    match Task::new(id).run(self.ctx) {
                        Ok(report) => {
                            self.ctx.emit(TaskEvent::Finished(report.clone()));
                            reports.push(report);
                        }
                        Err(e) => {
                            warn!(task = %id, error = %e, "task failed");
                            self.ctx.emit(TaskEvent::Failed {
                                id,
                                error: e.to_string(),
                            });
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(reports)
    }
}
