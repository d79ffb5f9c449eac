//! A real `dev` session on a temporary project: filesystem events go through
//! the debounced watcher and rebuild only the class whose sources changed.

use assetflow::config::PipelineConfig;
use assetflow::dev::DevSession;
use assetflow::pipeline::{Pipeline, Runner};
use assetflow::serve::{DevServer, ServeError};
use assetflow::task::TaskContext;
use assetflow::types::AssetClass;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    notified: Mutex<Vec<AssetClass>>,
    errors: Mutex<Vec<String>>,
}

impl DevServer for Recorder {
    fn start(&self, _root: &Path) -> Result<SocketAddr, ServeError> {
        Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
    }

    fn notify(&self, class: AssetClass) {
        self.notified.lock().unwrap().push(class);
    }

    fn report_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

fn project() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(root.join("src/style.scss"), ".a { width: 1px; }\n").unwrap();
    std::fs::write(root.join("src/app.js"), "1;").unwrap();
    (tmp, root)
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    done()
}

#[test]
fn editing_a_stylesheet_rebuilds_only_styles() {
    let (_tmp, root) = project();
    let mut config = PipelineConfig::default();
    config.watch.debounce_ms = 50;

    let server = Arc::new(Recorder::default());
    let ctx = Arc::new(TaskContext::new(&root, config, false).with_server(server.clone()));
    Runner::new(&ctx).run(&Pipeline::dev()).unwrap();
    let css = root.join("dist/css/style.css");
    assert!(std::fs::read_to_string(&css).unwrap().contains("width:1px"));
    server.notified.lock().unwrap().clear();

    let session = DevSession::start(Arc::clone(&ctx), server.clone()).unwrap();
    // Give the backend a moment to register its watches.
    std::thread::sleep(Duration::from_millis(200));
    std::fs::write(root.join("src/style.scss"), ".a { width: 2px; }\n").unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            session.dispatcher().cycles(AssetClass::Styles) > 0
                && std::fs::read_to_string(&css).is_ok_and(|s| s.contains("width:2px"))
        }),
        "styles were not rebuilt"
    );
    assert!(session.dispatcher().wait_idle(Duration::from_secs(10)));

    for class in AssetClass::ALL {
        if class != AssetClass::Styles {
            assert_eq!(session.dispatcher().cycles(class), 0, "{class} rebuilt");
        }
    }
    assert_eq!(session.dispatcher().cycles(AssetClass::Styles), 1);
    assert_eq!(*server.notified.lock().unwrap(), vec![AssetClass::Styles]);
    assert!(server.errors.lock().unwrap().is_empty());
    assert!(root.join("dist/js/app.js").exists());
}

#[test]
fn a_broken_stylesheet_reports_and_keeps_watching() {
    let (_tmp, root) = project();
    let mut config = PipelineConfig::default();
    config.watch.debounce_ms = 50;

    let server = Arc::new(Recorder::default());
    let ctx = Arc::new(TaskContext::new(&root, config, false).with_server(server.clone()));
    let session = DevSession::start(Arc::clone(&ctx), server.clone()).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    std::fs::write(root.join("src/style.scss"), ".a { width: 1px;\n").unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || !server.errors.lock().unwrap().is_empty()),
        "build error was not reported"
    );
    assert!(server.errors.lock().unwrap()[0].contains("styles"));

    std::fs::write(root.join("src/style.scss"), ".a { width: 3px; }\n").unwrap();
    let css = root.join("dist/css/style.css");
    assert!(
        wait_for(Duration::from_secs(10), || {
            std::fs::read_to_string(&css).is_ok_and(|s| s.contains("width:3px"))
        }),
        "watcher stopped after a failed cycle"
    );
    drop(session);
}
