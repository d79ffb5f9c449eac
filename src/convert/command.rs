//! External program converter.
//!
//! Used for the formats with no Rust implementation worth embedding: TTF →
//! WOFF2 (`ttf2woff2`) and Pug → HTML (`pug`). The program runs from the
//! project root, so relative options like `--basedir src/pages` resolve as
//! they would from a shell. A non-zero exit status is a conversion failure
//! and carries the program's stderr.

use super::{ConvertError, Converter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Placeholder in `args` replaced by the input path.
const INPUT_PLACEHOLDER: &str = "{input}";

pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    stdin: bool,
    extension: Option<String>,
    working_dir: PathBuf,
}

impl CommandConverter {
    pub fn new(
        program: String,
        args: Vec<String>,
        stdin: bool,
        extension: Option<String>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            program,
            args,
            stdin,
            extension,
            working_dir,
        }
    }

    fn expand_args(&self, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input))
            .collect()
    }
}

impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.program
    }

    fn output_extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError> {
        let args = self.expand_args(input);
        debug!(program = %self.program, ?args, "running converter");

        let payload = if self.stdin {
            Some(std::fs::read(input)?)
        } else {
            None
        };

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(if payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ConvertError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Feed stdin from a separate thread so a program that streams output
        // before consuming all input cannot deadlock on a full pipe.
        let writer = match (payload, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                Some(std::thread::spawn(move || pipe.write_all(&bytes)))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            // A program may legitimately exit without reading everything
            // (broken pipe); its exit status is what decides success.
            let _ = writer.join();
        }

        if !output.status.success() {
            return Err(ConvertError::Command {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn converter(program: &str, args: &[&str], stdin: bool) -> CommandConverter {
        CommandConverter::new(
            program.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
            stdin,
            Some("out".to_string()),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn input_placeholder_is_expanded() {
        let c = converter("pug", &["--path", "{input}", "--pretty"], true);
        assert_eq!(
            c.expand_args(Path::new("/src/pages/index.pug")),
            vec!["--path", "/src/pages/index.pug", "--pretty"]
        );
    }

    #[test]
    fn stdin_is_piped_and_stdout_captured() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.txt");
        std::fs::write(&input, "hello").unwrap();

        let c = converter("cat", &[], true);
        assert_eq!(c.convert(&input).unwrap(), b"hello");
        assert_eq!(c.output_extension(), Some("out"));
    }

    #[test]
    fn input_path_argument_mode() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.txt");
        std::fs::write(&input, "by path").unwrap();

        let c = converter("cat", &["{input}"], false);
        assert_eq!(c.convert(&input).unwrap(), b"by path");
    }

    #[test]
    fn non_zero_exit_is_command_error_with_stderr() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.txt");
        std::fs::write(&input, "").unwrap();

        let c = converter("sh", &["-c", "echo include not found >&2; exit 3"], false);
        match c.convert(&input) {
            Err(ConvertError::Command { stderr, .. }) => {
                assert_eq!(stderr, "include not found")
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in.txt");
        std::fs::write(&input, "").unwrap();

        let c = converter("definitely-not-a-real-converter", &[], false);
        assert!(matches!(c.convert(&input), Err(ConvertError::Spawn { .. })));
    }
}
