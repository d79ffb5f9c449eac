use clap::{Parser, Subcommand};
use assetflow::config::{self, PipelineConfig};
use assetflow::dev::DevSession;
use assetflow::output;
use assetflow::pipeline::{Pipeline, Runner};
use assetflow::serve::{DevServer, LiveServer};
use assetflow::task::{TaskContext, TaskEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "assetflow")]
#[command(about = "Clean-then-build asset pipeline for static sites")]
#[command(long_about = "\
Clean-then-build asset pipeline for static sites

Every asset class is cleaned and rebuilt from its sources, in this order:

  fonts    src/fonts/*.ttf     → dist/fonts/*.woff2   (ttf2woff2)
  files    src/files/**/*      → dist/files/          (copy)
  libs     src/libs/**/*       → dist/libs/           (copy)
  markup   src/pages/*.pug     → dist/*.html          (pug, BEM lint)
  images   src/images/**/*     → dist/images/         (optimized, cached)
  scripts  src/*.js            → dist/js/             (copy)
  styles   src/style.scss      → dist/css/style.css   (Sass, compressed)

'prod' builds once and exits non-zero if any task fails. 'dev' builds,
serves dist/ with live reload and rebuilds a class whenever its sources
change.

Run 'assetflow gen-config' to generate a documented assetflow.toml.")]
#[command(version)]
struct Cli {
    /// Project root containing src/ and assetflow.toml
    #[arg(long, default_value = ".", global = true)]
    project: PathBuf,

    /// Config file (default: <project>/assetflow.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable the image cache and re-encode every image
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build, then serve with live reload and rebuild on change
    Dev {
        /// Dev server port (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Build once for deployment
    Prod,
    /// Print a stock assetflow.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        Command::Prod => {
            let (project, config) = load(&cli.project, cli.config.as_deref())?;
            init_thread_pool(&config.processing);

            let (tx, printer) = spawn_printer(project.clone());
            let ctx = TaskContext::new(&project, config, !cli.no_cache).with_events(tx);
            let started = Instant::now();
            let result = Runner::new(&ctx).run(&Pipeline::prod());
            drop(ctx);
            join_printer(printer);

            let reports = result?;
            println!("{}", output::format_summary(&reports, started.elapsed()));
        }
        Command::Dev { port } => {
            let (project, mut config) = load(&cli.project, cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            init_thread_pool(&config.processing);

            let server: Arc<dyn DevServer> =
                Arc::new(LiveServer::new(config.server.host.clone(), config.server.port));
            let (tx, _printer) = spawn_printer(project.clone());
            let ctx = Arc::new(
                TaskContext::new(&project, config, !cli.no_cache)
                    .with_events(tx)
                    .with_server(Arc::clone(&server)),
            );

            Runner::new(&ctx).run(&Pipeline::dev())?;
            let session = DevSession::start(ctx, server)?;
            println!("\nServing http://{} (Ctrl-C to stop)", session.addr());
            session.run_forever();
        }
    }

    Ok(())
}

/// Canonical project root and its resolved configuration.
fn load(
    project: &Path,
    explicit: Option<&Path>,
) -> Result<(PathBuf, PipelineConfig), Box<dyn std::error::Error>> {
    let project = project
        .canonicalize()
        .map_err(|e| format!("project directory {}: {e}", project.display()))?;
    let config = config::load_config(&project, explicit)?;
    Ok((project, config))
}

/// Diagnostics go to stderr, filtered by `ASSETFLOW_LOG` (or `RUST_LOG`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ASSETFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("assetflow=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print task events from a background thread until every sender drops.
fn spawn_printer(root: PathBuf) -> (Sender<TaskEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            output::print_task_event(&event, Some(&root));
        }
    });
    (tx, printer)
}

fn join_printer(printer: JoinHandle<()>) {
    if printer.join().is_err() {
        eprintln!("progress printer panicked");
    }
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of CPU cores: the config can lower it, never raise it.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
