use super::{ConvertError, Converter};
use std::path::Path;

/// Passes files through unchanged.
pub struct CopyConverter;

impl Converter for CopyConverter {
    fn name(&self) -> &str {
        "copy"
    }

    fn output_extension(&self) -> Option<&str> {
        None
    }

    fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError> {
        Ok(std::fs::read(input)?)
    }
}
