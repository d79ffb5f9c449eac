//! Converters: one per asset class, input file → output bytes.
//!
//! | Kind | Used for | Implementation |
//! |---|---|---|
//! | `copy` | files, libs, scripts | read the file as-is |
//! | `command` | fonts (`ttf2woff2`), markup (`pug`) | external program, output read from stdout |
//! | `sass` | styles | `grass` SCSS compiler |
//! | `images` | images | `image` crate re-encoding + content-addressed skip-cache |
//!
//! Converters never write to the destination themselves: the build task
//! owns path mapping and writing, so a failing conversion and a failing
//! write are reported differently. Every converter is `Send + Sync` because
//! watch cycles of different classes run on different threads, and parallel
//! classes convert on the rayon pool.

pub mod bem;
mod command;
mod copy;
mod images;
mod sass;

pub use command::CommandConverter;
pub use copy::CopyConverter;
pub use images::ImageConverter;
pub use sass::SassConverter;

use crate::cache::ImageCache;
use crate::config::{ConverterConfig, PipelineConfig};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Sass: {0}")]
    Sass(String),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// A pure transformation from one source file to output bytes.
pub trait Converter: Send + Sync {
    /// Short name used in reports.
    fn name(&self) -> &str;

    /// Extension of produced files; `None` keeps the source extension.
    fn output_extension(&self) -> Option<&str>;

    /// Convert one input file.
    fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError>;

    /// Called once after every item of a build. Returns an optional summary
    /// line for the task report.
    fn finish(&self) -> Result<Option<String>, ConvertError> {
        Ok(None)
    }
}

/// Construct the converter described by `config` for a project.
///
/// `use_cache` turns the image skip-cache off regardless of config.
pub fn from_config(
    converter: &ConverterConfig,
    config: &PipelineConfig,
    project_root: &Path,
    use_cache: bool,
) -> Box<dyn Converter> {
    match converter {
        ConverterConfig::Copy => Box::new(CopyConverter),
        ConverterConfig::Command {
            program,
            args,
            stdin,
            extension,
        } => Box::new(CommandConverter::new(
            program.clone(),
            args.clone(),
            *stdin,
            extension.clone(),
            project_root.to_path_buf(),
        )),
        ConverterConfig::Sass { style, load_paths } => {
            let load_paths: Vec<PathBuf> =
                load_paths.iter().map(|p| project_root.join(p)).collect();
            Box::new(SassConverter::new(*style, load_paths))
        }
        ConverterConfig::Images { jpeg_quality } => {
            let cache = (use_cache && config.cache.enabled)
                .then(|| ImageCache::open(project_root.join(&config.cache.dir).join("images")));
            Box::new(ImageConverter::new(*jpeg_quality, cache))
        }
    }
}
