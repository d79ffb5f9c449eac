//! Shared test utilities for the assetflow test suite.
//!
//! Provides a throwaway project tree, a context wired with mock converters,
//! a recording dev server and a directory snapshot for before/after checks.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let project = TestProject::with_every_class();
//! let ctx = project.mock_context();
//! Runner::new(&ctx).run(&Pipeline::prod()).unwrap();
//!
//! let before = snapshot(&project.path("dist"));
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::convert::tests::MockConverter;
use crate::convert::{ConvertError, Converter};
use crate::serve::{DevServer, ServeError};
use crate::task::TaskContext;
use crate::types::AssetClass;

// =========================================================================
// Project tree
// =========================================================================

/// A project directory that disappears with the value.
pub struct TestProject {
    _tmp: TempDir,
    root: PathBuf,
}

impl TestProject {
    /// An empty project. The root is canonical so watcher paths compare
    /// equal to it.
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        Self { _tmp: tmp, root }
    }

    /// One source file for every asset class.
    pub fn with_every_class() -> Self {
        let project = Self::new();
        project.write("src/fonts/Inter.ttf", "font");
        project.write("src/files/robots.txt", "robots");
        project.write("src/libs/jquery.js", "jq");
        project.write("src/pages/index.pug", "page");
        project.write("src/images/logo.png", "png");
        project.write("src/app.js", "app");
        project.write("src/style.scss", "style");
        project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path(rel))
            .unwrap_or_else(|e| panic!("cannot read {rel}: {e}"))
    }

    /// Stock configuration with every converter replaced by a
    /// [`MockConverter`] that keeps source extensions.
    pub fn mock_context(&self) -> TaskContext {
        AssetClass::ALL.into_iter().fold(
            TaskContext::new(&self.root, PipelineConfig::default(), false),
            |ctx, class| ctx.with_converter(class, Arc::new(MockConverter::new())),
        )
    }
}

/// Every file below `dir`, relative path → contents. Missing dir = empty.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            let contents = String::from_utf8_lossy(&std::fs::read(e.path()).unwrap()).into_owned();
            (rel, contents)
        })
        .collect()
}

// =========================================================================
// Collaborator doubles
// =========================================================================

/// Converter that ignores its input and returns fixed HTML.
pub struct StaticConverter {
    body: String,
}

impl StaticConverter {
    pub fn html(body: &str) -> Self {
        Self {
            body: body.to_string(),
        }
    }
}

impl Converter for StaticConverter {
    fn name(&self) -> &str {
        "static"
    }

    fn output_extension(&self) -> Option<&str> {
        Some("html")
    }

    fn convert(&self, _input: &Path) -> Result<Vec<u8>, ConvertError> {
        Ok(self.body.clone().into_bytes())
    }
}

/// Dev server double that records every call.
#[derive(Default)]
pub struct RecordingServer {
    started: Mutex<Option<PathBuf>>,
    notified: Mutex<Vec<AssetClass>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingServer {
    pub const ADDR: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
        std::net::Ipv4Addr::LOCALHOST,
        3000,
    ));

    pub fn started_with(&self) -> Option<PathBuf> {
        self.started.lock().unwrap().clone()
    }

    pub fn notified(&self) -> Vec<AssetClass> {
        self.notified.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl DevServer for RecordingServer {
    fn start(&self, root: &Path) -> Result<SocketAddr, ServeError> {
        *self.started.lock().unwrap() = Some(root.to_path_buf());
        Ok(Self::ADDR)
    }

    fn notify(&self, class: AssetClass) {
        self.notified.lock().unwrap().push(class);
    }

    fn report_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}
