use super::{ConvertError, Converter};
use crate::config::SassStyle;
use grass::{Options, OutputStyle};
use std::path::{Path, PathBuf};

/// SCSS → CSS via `grass`.
///
/// `@use`/`@import` resolve relative to the importing file first, then
/// through `load_paths`.
pub struct SassConverter {
    style: SassStyle,
    load_paths: Vec<PathBuf>,
}

impl SassConverter {
    pub fn new(style: SassStyle, load_paths: Vec<PathBuf>) -> Self {
        Self { style, load_paths }
    }
}

impl Converter for SassConverter {
    fn name(&self) -> &str {
        "sass"
    }

    fn output_extension(&self) -> Option<&str> {
        Some("css")
    }

    fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError> {
        let style = match self.style {
            SassStyle::Compressed => OutputStyle::Compressed,
            SassStyle::Expanded => OutputStyle::Expanded,
        };
        let options = Options::default()
            .load_paths(&self.load_paths)
            .style(style);
        let css = grass::from_path(input, &options).map_err(|e| ConvertError::Sass(e.to_string()))?;
        Ok(css.into_bytes())
    }
}
