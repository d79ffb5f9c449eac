//! Pipeline configuration.
//!
//! The asset table (which globs feed which converter, and where the output
//! lands) is compiled in as stock defaults. An optional `assetflow.toml` in
//! the project root overrides any subset of it:
//!
//! ```toml
//! # Only move the stylesheet entry point
//! [classes.styles]
//! source = "src/scss/main.scss"
//! ```
//!
//! Loading merges the user file over the stock table key-by-key, rejects
//! unknown keys, then validates the result. Run `assetflow gen-config` for a
//! fully commented copy of the defaults.
//!
//! ## Path conventions
//!
//! - `source`, `watch` and `load_paths` are relative to the project root.
//! - `output_dir` is relative to the project root.
//! - `dest` is relative to `output_dir`; an empty `dest` is the output root.
//! - `clean` is a glob relative to `dest`.

use crate::paths;
use crate::types::AssetClass;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// File name looked up in the project root when no `--config` is given.
pub const CONFIG_FILENAME: &str = "assetflow.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Output root, relative to the project root. Purged at startup.
    pub output_dir: String,
    /// Development server settings (`dev` only).
    pub server: ServerConfig,
    /// File watching settings (`dev` only).
    pub watch: WatchConfig,
    /// Parallel conversion settings.
    pub processing: ProcessingConfig,
    /// Image skip-cache settings.
    pub cache: CacheConfig,
    /// One entry per asset class.
    pub classes: ClassTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: "dist".to_string(),
            server: ServerConfig::default(),
            watch: WatchConfig::default(),
            processing: ProcessingConfig::default(),
            cache: CacheConfig::default(),
            classes: ClassTable::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration for one asset class.
    pub fn class(&self, class: AssetClass) -> &ClassConfig {
        self.classes.get(class)
    }

    /// Absolute output root for a project.
    pub fn output_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.output_dir)
    }

    /// Absolute destination directory of a class.
    pub fn dest_dir(&self, project_root: &Path, class: AssetClass) -> PathBuf {
        let dest = &self.class(class).dest;
        if dest.is_empty() {
            self.output_root(project_root)
        } else {
            self.output_root(project_root).join(dest)
        }
    }

    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation("output_dir must not be empty".into()));
        }
        // The output root is purged wholesale, so it must be a real
        // subdirectory of the project that holds no sources.
        let output = Path::new(&self.output_dir);
        if !is_contained(output) || normalized(output).as_os_str().is_empty() {
            return Err(ConfigError::Validation(format!(
                "output_dir '{}' must be a subdirectory of the project",
                self.output_dir
            )));
        }
        if self.watch.debounce_ms == 0 {
            return Err(ConfigError::Validation(
                "watch.debounce_ms must be greater than zero".into(),
            ));
        }
        for class in AssetClass::ALL {
            self.class(class).validate(class)?;
        }
        self.validate_sources_outside_output()?;
        self.validate_disjoint_destinations()
    }

    fn validate_sources_outside_output(&self) -> Result<(), ConfigError> {
        let output = normalized(Path::new(&self.output_dir));
        for class in AssetClass::ALL {
            let cfg = self.class(class);
            for pattern in [cfg.source.as_str(), cfg.watch_pattern()] {
                let base = normalized(&paths::glob_base(pattern));
                if base.starts_with(&output) {
                    return Err(ConfigError::Validation(format!(
                        "classes.{class}: '{pattern}' lies inside output_dir '{}', \
                         which is purged on every run",
                        self.output_dir
                    )));
                }
            }
        }
        Ok(())
    }

    /// Each class owns its destination: no two share one, and a class whose
    /// destination contains another's may only clean its own top level.
    fn validate_disjoint_destinations(&self) -> Result<(), ConfigError> {
        for (i, outer) in AssetClass::ALL.into_iter().enumerate() {
            let outer_cfg = self.class(outer);
            let outer_dest = normalized(Path::new(&outer_cfg.dest));
            for inner in AssetClass::ALL.into_iter().skip(i + 1) {
                let inner_dest = normalized(Path::new(&self.class(inner).dest));
                if outer_dest == inner_dest {
                    return Err(ConfigError::Validation(format!(
                        "classes.{outer} and classes.{inner} share dest '{}'",
                        outer_cfg.dest
                    )));
                }
                for (parent, parent_dest, child, child_dest) in [
                    (outer, &outer_dest, inner, &inner_dest),
                    (inner, &inner_dest, outer, &outer_dest),
                ] {
                    let Ok(below) = child_dest.strip_prefix(parent_dest) else {
                        continue;
                    };
                    if !self.class(parent).cleans_only_top_level_beside(below) {
                        return Err(ConfigError::Validation(format!(
                            "classes.{parent}: clean glob '{}' reaches into the dest of \
                             classes.{child}",
                            self.class(parent).clean
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Development server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; `0` picks a free port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// File watching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Quiet period before a burst of file events is dispatched.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel conversion workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// Image skip-cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Set to false to always re-optimize images.
    pub enabled: bool,
    /// Cache directory, relative to the project root. Kept outside the
    /// output root so purges and cleans leave it alone.
    pub dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: ".assetflow-cache".to_string(),
        }
    }
}

/// The per-class table, one field per [`AssetClass`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassTable {
    pub fonts: ClassConfig,
    pub files: ClassConfig,
    pub libs: ClassConfig,
    pub markup: ClassConfig,
    pub images: ClassConfig,
    pub scripts: ClassConfig,
    pub styles: ClassConfig,
}

impl ClassTable {
    pub fn get(&self, class: AssetClass) -> &ClassConfig {
        match class {
            AssetClass::Fonts => &self.fonts,
            AssetClass::Files => &self.files,
            AssetClass::Libs => &self.libs,
            AssetClass::Markup => &self.markup,
            AssetClass::Images => &self.images,
            AssetClass::Scripts => &self.scripts,
            AssetClass::Styles => &self.styles,
        }
    }

    pub fn get_mut(&mut self, class: AssetClass) -> &mut ClassConfig {
        match class {
            AssetClass::Fonts => &mut self.fonts,
            AssetClass::Files => &mut self.files,
            AssetClass::Libs => &mut self.libs,
            AssetClass::Markup => &mut self.markup,
            AssetClass::Images => &mut self.images,
            AssetClass::Scripts => &mut self.scripts,
            AssetClass::Styles => &mut self.styles,
        }
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self {
            fonts: ClassConfig {
                source: "src/fonts/*.ttf".to_string(),
                watch: None,
                dest: "fonts".to_string(),
                clean: "*.woff2".to_string(),
                extensions: Vec::new(),
                reload: false,
                parallel: false,
                validate_bem: false,
                converter: ConverterConfig::Command {
                    program: "ttf2woff2".to_string(),
                    args: Vec::new(),
                    stdin: true,
                    extension: Some("woff2".to_string()),
                },
            },
            files: ClassConfig::copy("src/files/**/*", "files", "**/*"),
            libs: ClassConfig::copy("src/libs/**/*", "libs", "**/*"),
            markup: ClassConfig {
                source: "src/pages/*.pug".to_string(),
                watch: Some("src/**/*.pug".to_string()),
                dest: String::new(),
                clean: "*.html".to_string(),
                extensions: Vec::new(),
                reload: true,
                parallel: false,
                validate_bem: true,
                converter: ConverterConfig::Command {
                    program: "pug".to_string(),
                    args: ["--pretty", "--basedir", "src/pages", "--path", "{input}"]
                        .map(String::from)
                        .to_vec(),
                    stdin: true,
                    extension: Some("html".to_string()),
                },
            },
            images: ClassConfig {
                source: "src/images/**/*".to_string(),
                watch: None,
                dest: "images".to_string(),
                clean: "**/*".to_string(),
                extensions: ["jpg", "jpeg", "png", "svg", "ico", "gif"]
                    .map(String::from)
                    .to_vec(),
                reload: true,
                parallel: true,
                validate_bem: false,
                converter: ConverterConfig::Images {
                    jpeg_quality: default_jpeg_quality(),
                },
            },
            scripts: ClassConfig {
                reload: true,
                ..ClassConfig::copy("src/*.js", "js", "*.js")
            },
            styles: ClassConfig {
                source: "src/style.scss".to_string(),
                watch: Some("src/**/*.scss".to_string()),
                dest: "css".to_string(),
                clean: "**/*.css".to_string(),
                extensions: Vec::new(),
                reload: true,
                parallel: false,
                validate_bem: false,
                converter: ConverterConfig::Sass {
                    style: SassStyle::Compressed,
                    load_paths: Vec::new(),
                },
            },
        }
    }
}

/// Source, destination and converter for one asset class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassConfig {
    /// Glob selecting the inputs of a build.
    pub source: String,
    /// Glob whose changes trigger a rebuild in `dev`; defaults to `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<String>,
    /// Destination directory, relative to `output_dir`.
    pub dest: String,
    /// Glob of outputs removed by a clean, relative to `dest`.
    pub clean: String,
    /// Case-insensitive extension filter on build inputs. Empty = all files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    /// Ask the dev server to refresh clients after a successful build.
    #[serde(default)]
    pub reload: bool,
    /// Convert inputs on the worker pool instead of one at a time.
    #[serde(default)]
    pub parallel: bool,
    /// Check BEM class naming in the written output.
    #[serde(default)]
    pub validate_bem: bool,
    pub converter: ConverterConfig,
}

impl ClassConfig {
    fn copy(source: &str, dest: &str, clean: &str) -> Self {
        Self {
            source: source.to_string(),
            watch: None,
            dest: dest.to_string(),
            clean: clean.to_string(),
            extensions: Vec::new(),
            reload: false,
            parallel: false,
            validate_bem: false,
            converter: ConverterConfig::Copy,
        }
    }

    /// The glob whose changes retrigger this class.
    pub fn watch_pattern(&self) -> &str {
        self.watch.as_deref().unwrap_or(&self.source)
    }

    /// True when the clean glob stays in the top level of `dest` and does not
    /// match the first component of `nested`, a directory below it.
    fn cleans_only_top_level_beside(&self, nested: &Path) -> bool {
        if self.clean.contains("**") || self.clean.contains('/') {
            return false;
        }
        let Some(first) = nested.components().next() else {
            return false;
        };
        match glob::Pattern::new(&self.clean) {
            Ok(pattern) => !pattern.matches(&first.as_os_str().to_string_lossy()),
            Err(_) => false,
        }
    }

    fn validate(&self, class: AssetClass) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Validation(format!("classes.{class}: {msg}"));

        if self.source.trim().is_empty() {
            return Err(invalid("source must not be empty".into()));
        }
        for (key, pattern) in [
            ("source", self.source.as_str()),
            ("watch", self.watch_pattern()),
            ("clean", self.clean.as_str()),
        ] {
            glob::Pattern::new(pattern)
                .map_err(|e| invalid(format!("{key} is not a valid glob: {e}")))?;
        }
        if self.clean.trim().is_empty() {
            return Err(invalid("clean must not be empty".into()));
        }
        if !is_contained(Path::new(&self.dest)) {
            return Err(invalid(format!(
                "dest '{}' must be a relative path inside output_dir",
                self.dest
            )));
        }
        match &self.converter {
            ConverterConfig::Command { program, .. } if program.trim().is_empty() => {
                Err(invalid("converter.program must not be empty".into()))
            }
            ConverterConfig::Images { jpeg_quality } if !(1..=100).contains(jpeg_quality) => {
                Err(invalid("converter.jpeg_quality must be 1-100".into()))
            }
            _ => Ok(()),
        }
    }
}

/// True when `path` is relative and never climbs out of its parent.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `path` without `.` components.
fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Which converter a class uses, with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConverterConfig {
    /// Byte-for-byte copy.
    Copy,
    /// External program. `{input}` in `args` is replaced by the input path.
    /// With `stdin`, the input bytes are piped in; the output is always read
    /// from stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        stdin: bool,
        /// Extension of the produced files; absent keeps the source extension.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extension: Option<String>,
    },
    /// SCSS compilation.
    Sass {
        #[serde(default)]
        style: SassStyle,
        #[serde(default)]
        load_paths: Vec<String>,
    },
    /// PNG/JPEG re-encoding; other formats pass through.
    Images {
        #[serde(default = "default_jpeg_quality")]
        jpeg_quality: u8,
    },
}

fn default_jpeg_quality() -> u8 {
    80
}

/// Output style of compiled stylesheets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SassStyle {
    #[default]
    Compressed,
    Expanded,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(PipelineConfig::default())
        .map_err(|e| ConfigError::Validation(format!("stock config does not serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<PipelineConfig, ConfigError> {
    let mut base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => {
            drop_retyped_converters(&mut base, &ov);
            merge_toml(base, ov)
        }
        None => base,
    };
    let config: PipelineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// A converter table that names its `kind` replaces the stock one instead
/// of merging into it, so options of the old kind do not leak into the new.
fn drop_retyped_converters(base: &mut toml::Value, overlay: &toml::Value) {
    let Some(overlay_classes) = overlay.get("classes").and_then(|v| v.as_table()) else {
        return;
    };
    let Some(base_classes) = base.get_mut("classes").and_then(|v| v.as_table_mut()) else {
        return;
    };
    for (name, class) in overlay_classes {
        let retyped = class
            .get("converter")
            .is_some_and(|c| c.get("kind").is_some());
        if retyped
            && let Some(base_class) = base_classes.get_mut(name).and_then(|v| v.as_table_mut())
        {
            base_class.remove("converter");
        }
    }
}

/// Load the pipeline config for a project.
///
/// With `explicit`, that file must exist. Otherwise `assetflow.toml` in the
/// project root is used when present, and the stock table when not.
pub fn load_config(
    project_root: &Path,
    explicit: Option<&Path>,
) -> Result<PipelineConfig, ConfigError> {
    let path = match explicit {
        Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
        Some(path) => path.to_path_buf(),
        None => project_root.join(CONFIG_FILENAME),
    };
    let overlay = if path.exists() {
        let content = fs::read_to_string(&path)?;
        Some(toml::from_str::<toml::Value>(&content)?)
    } else {
        None
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `assetflow.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# assetflow configuration
# =======================
# All settings are optional. Values shown below are the defaults; keep only
# the keys you want to change. Unknown keys are rejected.
#
# Paths: `source`, `watch` and `load_paths` are relative to the project root,
# `dest` is relative to `output_dir`, and `clean` is a glob relative to `dest`.
# Globs: `*` stays within one directory, `**` spans directories.

# Output root. Removed entirely at the start of `dev` and `prod`.
output_dir = "dist"

# ---------------------------------------------------------------------------
# Development server (`assetflow dev`)
# ---------------------------------------------------------------------------
[server]
host = "127.0.0.1"
port = 3000

[watch]
# Quiet period before a burst of file changes triggers a rebuild.
debounce_ms = 200

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel conversion workers for classes with `parallel = true`.
# Omit to auto-detect (= number of CPU cores).
# max_processes = 4

[cache]
# Optimized images are cached by content so unchanged inputs skip encoding.
enabled = true
dir = ".assetflow-cache"

# ---------------------------------------------------------------------------
# Asset classes, in build order
# ---------------------------------------------------------------------------
[classes.fonts]
source = "src/fonts/*.ttf"
dest = "fonts"
clean = "*.woff2"
reload = false
parallel = false
validate_bem = false

[classes.fonts.converter]
kind = "command"
program = "ttf2woff2"
args = []
stdin = true
extension = "woff2"

[classes.files]
source = "src/files/**/*"
dest = "files"
clean = "**/*"
reload = false
parallel = false
validate_bem = false

[classes.files.converter]
kind = "copy"

[classes.libs]
source = "src/libs/**/*"
dest = "libs"
clean = "**/*"
reload = false
parallel = false
validate_bem = false

[classes.libs.converter]
kind = "copy"

[classes.markup]
source = "src/pages/*.pug"
# Partials anywhere under src/ rebuild every page.
watch = "src/**/*.pug"
dest = ""
clean = "*.html"
reload = true
parallel = false
# Warn about BEM naming mistakes in the generated HTML.
validate_bem = true

[classes.markup.converter]
kind = "command"
program = "pug"
args = ["--pretty", "--basedir", "src/pages", "--path", "{input}"]
stdin = true
extension = "html"

[classes.images]
source = "src/images/**/*"
extensions = ["jpg", "jpeg", "png", "svg", "ico", "gif"]
dest = "images"
clean = "**/*"
reload = true
parallel = true
validate_bem = false

[classes.images.converter]
kind = "images"
# JPEG re-encoding quality (1-100). PNGs are recompressed losslessly.
jpeg_quality = 80

[classes.scripts]
source = "src/*.js"
dest = "js"
clean = "*.js"
reload = true
parallel = false
validate_bem = false

[classes.scripts.converter]
kind = "copy"

[classes.styles]
# Single entry point; everything else is reached through @use/@import.
source = "src/style.scss"
watch = "src/**/*.scss"
dest = "css"
clean = "**/*.css"
reload = true
parallel = false
validate_bem = false

[classes.styles.converter]
kind = "sass"
style = "compressed"
load_paths = []
"##
}
