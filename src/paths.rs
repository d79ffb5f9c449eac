//! Glob expansion and source-to-destination path mapping.
//!
//! Patterns are matched with `*` confined to one path component and `**`
//! spanning any depth, so `src/*.js` never picks up `src/vendor/x.js`.
//!
//! Outputs mirror their input's position below the pattern's *glob base*,
//! the longest leading run of literal components:
//!
//! ```text
//! src/files/**/*      base src/files    src/files/a/b.txt  →  <dest>/a/b.txt
//! src/fonts/*.ttf     base src/fonts    src/fonts/x.ttf    →  <dest>/x.woff2
//! src/style.scss      base src          src/style.scss     →  <dest>/style.css
//! ```

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathsError {
    #[error("invalid glob '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Matching rules shared by expansion and watch dispatch.
pub fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Literal directory prefix of a pattern.
///
/// A pattern without any glob syntax names a single file; its base is the
/// file's parent directory.
pub fn glob_base(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut base = PathBuf::new();
    for component in path.components() {
        if has_glob_meta(&component.as_os_str().to_string_lossy()) {
            return base;
        }
        base.push(component);
    }
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Anchor a relative pattern at `root`, escaping the root itself.
fn anchored(root: &Path, pattern: &str) -> String {
    let root = Pattern::escape(&root.to_string_lossy());
    if root.is_empty() {
        pattern.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), pattern)
    }
}

fn expand(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, PathsError> {
    let full = anchored(root, pattern);
    let entries = glob::glob_with(&full, match_options()).map_err(|source| PathsError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => {
                let path = e.path().to_path_buf();
                return Err(PathsError::Unreadable {
                    path,
                    source: e.into_error(),
                });
            }
        }
    }
    paths.sort();
    Ok(paths)
}

/// Every existing path (files and directories) matching `pattern` below
/// `root`, sorted.
pub fn expand_all(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, PathsError> {
    expand(root, pattern)
}

/// Regular files matching `pattern` below `root`, filtered by extension
/// (case-insensitive; empty filter keeps everything), sorted.
pub fn expand_files(
    root: &Path,
    pattern: &str,
    extensions: &[String],
) -> Result<Vec<PathBuf>, PathsError> {
    Ok(expand(root, pattern)?
        .into_iter()
        .filter(|p| p.is_file())
        .filter(|p| has_extension(p, extensions))
        .collect())
}

/// True when `extensions` is empty or contains the path's extension.
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Destination of `input`: its path below `base`, re-rooted at `dest`, with
/// the extension replaced when `extension` is given.
pub fn output_path(base: &Path, input: &Path, dest: &Path, extension: Option<&str>) -> PathBuf {
    let relative = match input.strip_prefix(base) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => input.file_name().map(PathBuf::from).unwrap_or_default(),
    };
    let mut output = dest.join(relative);
    if let Some(ext) = extension {
        output.set_extension(ext);
    }
    output
}

/// Test a project-relative path against a watch pattern.
pub fn matches(pattern: &Pattern, relative: &Path) -> bool {
    pattern.matches_path_with(relative, match_options())
}
