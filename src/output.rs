//! CLI output formatting for pipeline progress.
//!
//! # Output Format
//!
//! ```text
//! Purged dist
//! fonts clean     0 removed
//! fonts build     1 written    (38ms)
//! images build    4 written    (1.20s)
//!     Cache: 3 cached, 1 optimized (4 total)
//! markup build    2 written    (210ms)
//!     warning: dist/index.html: line 12: 'card__body__text' is an element of an element
//!
//! Changed src/partials/_buttons.scss → styles
//! styles clean    1 removed
//! styles build    1 written    (95ms)
//! styles build FAILED
//!     styles: failed to convert src/style.scss: Sass: expected "}".
//! ```
//!
//! # Architecture
//!
//! [`format_task_event`] returns `Vec<String>` for testability; the `print_*`
//! wrappers write to stdout. Format functions are pure: no I/O, no side
//! effects.

use crate::task::{TaskEvent, TaskReport};
use crate::types::Phase;
use std::path::Path;
use std::time::Duration;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `38ms` below a second, `1.20s` above.
pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// Show `path` relative to `root` when it lies below it.
fn shown<'a>(path: &'a Path, root: Option<&Path>) -> std::path::Display<'a> {
    root.and_then(|r| path.strip_prefix(r).ok())
        .unwrap_or(path)
        .display()
}

fn report_lines(report: &TaskReport) -> Vec<String> {
    let mut lines = Vec::new();
    let head = format!("{:<15}", report.id.to_string());
    lines.push(match report.id.phase {
        Phase::Clean => format!("{head} {} removed", report.files),
        Phase::Build => format!(
            "{head} {} written    ({})",
            report.files,
            format_duration(report.elapsed())
        ),
    });
    if let Some(summary) = &report.summary {
        lines.push(format!("{}{}", indent(1), summary));
    }
    for warning in &report.warnings {
        lines.push(format!("{}warning: {}", indent(1), warning));
    }
    lines
}

/// Lines for one progress event. Paths are shown relative to `root`.
pub fn format_task_event(event: &TaskEvent, root: Option<&Path>) -> Vec<String> {
    match event {
        TaskEvent::Purged { path } => vec![format!("Purged {}", shown(path, root))],
        TaskEvent::Started { .. } => Vec::new(),
        TaskEvent::Finished(report) => report_lines(report),
        TaskEvent::Failed { id, error } => {
            let mut lines = vec![format!("{id} FAILED")];
            lines.extend(error.lines().map(|l| format!("{}{}", indent(1), l)));
            lines
        }
        TaskEvent::Changed { class, path } => {
            vec![String::new(), format!("Changed {} → {class}", shown(path, root))]
        }
    }
}

pub fn print_task_event(event: &TaskEvent, root: Option<&Path>) {
    for line in format_task_event(event, root) {
        println!("{}", line);
    }
}

/// Final line of a one-shot build.
pub fn format_summary(reports: &[TaskReport], elapsed: Duration) -> String {
    let written: usize = reports
        .iter()
        .filter(|r| r.id.phase == Phase::Build)
        .map(|r| r.files)
        .sum();
    let warnings: usize = reports.iter().map(|r| r.warnings.len()).sum();
    let mut line = format!("Built {} files in {}", written, format_duration(elapsed));
    if warnings > 0 {
        line.push_str(&format!(", {} warnings", warnings));
    }
    line
}
