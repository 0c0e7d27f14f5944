//! # sketchforge - Incremental firmware builds
//!
//! sketchforge compiles a sketch, its libraries and the board's core into a
//! firmware image. Every tool invocation comes from a platform recipe
//! (`recipe.cpp.o.pattern`, `recipe.c.combine.pattern`, ...) expanded
//! against a property store, so no compiler is hard-coded.
//!
//! ## Features
//!
//! - **Recipes**: `{key}` templates with nested expansion and quoted argv splitting
//! - **Incremental**: mtime and `.d` dependency file checks per object
//! - **Parallel Builds**: bounded worker pool, first error cancels the rest
//! - **Core Cache**: compiled cores shared across sketches for the same board
//!
//! ## Quick Start
//!
//! ```bash
//! skf build
//! skf build --clean -v
//! ```
//!
//! ## Module Organization
//!
//! - [`build`] - Build engine: freshness, recipes, compiler, archives, phases
//! - [`properties`] - Property store and template expansion
//! - [`config`] - Project configuration (`sketchforge.toml`)

/// Build engine and pipeline phases.
pub mod build;

/// Cached core management.
pub mod cache;

/// Project configuration (`sketchforge.toml`).
pub mod config;

/// Typed build errors.
pub mod error;

/// Property key names used by the build engine.
pub mod keys;

/// Library folders and `library.properties`.
pub mod library;

/// Tracing setup and status output.
pub mod logging;

/// Ordered property store with `{key}` expansion.
pub mod properties;

/// Terminal tables.
pub mod ui;
