//! # assetflow
//!
//! A clean-then-build asset pipeline for static sites. Sources under `src/`
//! (templates, stylesheets, images, fonts, scripts, vendored libraries) are
//! converted into a deployable `dist/`, and `dev` keeps it up to date while
//! serving it with live reload.
//!
//! # Architecture: Task Graph Over Pluggable Converters
//!
//! The only logic of its own is the task graph. Every transformation is a
//! [`convert::Converter`]: input file in, output bytes out.
//!
//! ```text
//! prod   purge → (clean X → build X) for X in fonts, files, libs, markup,
//!                                         images, scripts, styles
//! dev    same, then serve dist/ and watch:
//!        change in X's watch glob → clean X → build X → notify server
//! ```
//!
//! Each asset class owns its destination subtree, so classes never
//! interfere with each other and watch cycles of different classes can run
//! concurrently. Within one class a clean always finishes before its build
//! starts.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | `AssetClass`, `Phase`, `TaskId` |
//! | [`config`] | Stock class table, `assetflow.toml` loading, merging and validation |
//! | [`paths`] | Glob expansion, glob base and output path mapping |
//! | [`convert`] | Converter trait and the copy, command, Sass and image converters; BEM lint |
//! | [`cache`] | Content-addressed skip-cache for image optimization |
//! | [`task`] | Clean and build tasks, purge, task context and events |
//! | [`pipeline`] | Explicit step lists (`dev`, `prod`, per-class) and the sequential runner |
//! | [`watch`] | Debounced file watching and per-class rebuild workers |
//! | [`serve`] | Static dev server with Server-Sent-Events live reload |
//! | [`dev`] | The `dev` session owning server and watcher |
//! | [`output`] | CLI output formatting of task events |
//!
//! # Design Decisions
//!
//! ## Tasks Write, Converters Transform
//!
//! Converters return bytes and never touch the destination. The build task
//! maps paths and writes, so a broken stylesheet (`TaskError::Converter`)
//! and a full disk (`TaskError::Write`) are told apart, and converters are
//! trivially mockable in tests.
//!
//! ## External Programs Where Rust Has No Equivalent
//!
//! Pug templates and WOFF2 fonts are produced by `pug` and `ttf2woff2`
//! through [`convert::CommandConverter`], reading from stdin and writing to
//! stdout. SCSS compiles in-process with `grass`, images re-encode with the
//! `image` crate.
//!
//! ## Dev Session As A Value
//!
//! The watcher and server are owned by one [`dev::DevSession`] constructed
//! only by `dev`. `prod` never creates one, and nothing global holds them.

pub mod cache;
pub mod config;
pub mod convert;
pub mod dev;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod serve;
pub mod task;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;
