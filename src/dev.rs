//! The long-lived `dev` session: dev server plus watcher.
//!
//! Only `dev` constructs one, after the startup pipeline has succeeded.
//! Dropping the session stops watching; the server thread lives until the
//! process exits.

use crate::serve::{DevServer, ServeError};
use crate::task::TaskContext;
use crate::watch::{Dispatcher, FileWatcher, WatchError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DevError {
    #[error("dev server: {0}")]
    Serve(#[from] ServeError),
    #[error("watcher: {0}")]
    Watch(#[from] WatchError),
}

pub struct DevSession {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    _watcher: FileWatcher,
}

impl DevSession {
    /// Serve the output root and start watching the project.
    ///
    /// `server` should be the same instance the context notifies, so
    /// rebuilds reach the pages it serves.
    pub fn start(ctx: Arc<TaskContext>, server: Arc<dyn DevServer>) -> Result<Self, DevError> {
        let addr = server.start(&ctx.output_root())?;
        let debounce = Duration::from_millis(ctx.config().watch.debounce_ms);
        let root = ctx.project_root().to_path_buf();

        let dispatcher = Arc::new(Dispatcher::new(ctx)?);
        let watcher = FileWatcher::new(&root, debounce, Arc::clone(&dispatcher))?;
        info!(%addr, "dev session started");

        Ok(Self {
            addr,
            dispatcher,
            _watcher: watcher,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Block the calling thread for the rest of the process.
    pub fn run_forever(self) -> ! {
        loop {
            std::thread::park();
        }
    }
}
