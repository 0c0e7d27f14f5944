//! Diagnostic tracing and user-facing status lines.
//!
//! Status lines go to stdout with colored glyphs. Decision tracing
//! (freshness verdicts, cache lookups, command lines) goes through `tracing`
//! to stderr and is only enabled when `RUST_LOG` is set, e.g.
//! `RUST_LOG=sketchforge=debug skf build`.

use colored::*;
use std::fmt::Display;
use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Installs the `tracing` subscriber once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_level(true),
                )
                .with(filter)
                .init();
        }
    });
}

pub fn success(msg: impl Display) {
    println!("{} {}", "✓".green(), msg);
}

pub fn warn(msg: impl Display) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn error(msg: impl Display) {
    eprintln!("{} {}", "x".red(), msg);
}

/// Indented detail line under a phase heading.
pub fn step(msg: impl Display) {
    println!("   {} {}", "→".dimmed(), msg);
}

/// Only printed in verbose mode.
pub fn verbose(enabled: bool, msg: impl Display) {
    if enabled {
        println!("   {}", msg.to_string().dimmed());
    }
}
