//! # sketchforge CLI Entry Point
//!
//! This is the main executable for the `skf` command-line tool.
//! It parses CLI arguments using clap and routes commands to the library.
//!
//! ## Command Structure
//!
//! - **Build**: `build`, `show-properties`
//! - **Cache**: `cache path`, `cache ls`, `cache clean`
//! - **Shell**: `completion`

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::*;
use std::path::{Path, PathBuf};

use sketchforge::build::{Builder, SizeReport};
use sketchforge::cache;
use sketchforge::config::{self, BuildConfig, CONFIG_FILE};
use sketchforge::logging;
use sketchforge::ui;

#[derive(Parser)]
#[command(name = "skf")]
#[command(
    about = "Incremental firmware builds driven by platform recipes",
    version = env!("CARGO_PKG_VERSION")
)]
#[command(long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the core, libraries and sketch, then link and check size
    Build {
        /// Project file
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
        /// Show every command and reuse decision
        #[arg(short, long)]
        verbose: bool,
        /// Parallel compile jobs (0 = number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Wipe the build directory and ignore the core cache
        #[arg(long)]
        clean: bool,
        /// Compiler warning level
        #[arg(long, value_parser = ["none", "default", "more", "all"])]
        warnings: Option<String>,
        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print the merged build properties
    ShowProperties {
        /// Project file
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
        /// Only keys starting with this prefix
        prefix: Option<String>,
        /// Expand `{key}` references in values
        #[arg(long)]
        expand: bool,
    },
    /// Manage the cross-build core cache
    Cache {
        /// Project file, for its `[paths] cache` override
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
        #[command(subcommand)]
        op: CacheOp,
    },
    /// Generate shell completion scripts
    Completion { shell: Shell },
}

#[derive(Subcommand)]
enum CacheOp {
    /// Remove all cached cores
    Clean,
    /// List cached cores
    Ls,
    /// Print cache directory path
    Path,
}

fn main() {
    logging::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        logging::error(format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            config,
            verbose,
            jobs,
            clean,
            warnings,
            no_progress,
        } => {
            let mut build_config = config::load_config(&config)?;
            build_config.verbose |= verbose;
            build_config.clean |= clean;
            build_config.progress = !no_progress;
            if let Some(jobs) = jobs {
                build_config.jobs = jobs;
            }
            if let Some(warnings) = warnings {
                build_config.warnings = warnings;
            }

            let builder = Builder::new(build_config)?;
            let summary = builder.build()?;

            if let SizeReport::Checked(sections) = &summary.size {
                ui::size_table(sections).print();
            }
            let reused = summary.all_files().count() - summary.recompiled();
            println!(
                "   {} {} compiled, {} up to date{}",
                "→".dimmed(),
                summary.recompiled(),
                reused,
                if summary.core_from_cache { ", core from cache" } else { "" }
            );
            Ok(())
        }

        Commands::ShowProperties {
            config,
            prefix,
            expand,
        } => {
            let builder = Builder::new(config::load_config(&config)?)?;
            let props = builder.properties();
            let mut table = ui::Table::new(&["Key", "Value"]);
            for (key, value) in props.iter() {
                if prefix.as_deref().is_some_and(|p| !key.starts_with(p)) {
                    continue;
                }
                let value = if expand {
                    props.expand_props_in_string(value)
                } else {
                    value.to_string()
                };
                table.add_row(vec![key.to_string(), value]);
            }
            table.print();
            Ok(())
        }

        Commands::Cache { config, op } => {
            let cache_dir = resolve_cache_dir(&config)?;
            match op {
                CacheOp::Clean => cache::clean(&cache_dir).map(|_| ()),
                CacheOp::Ls => cache::list(&cache_dir),
                CacheOp::Path => {
                    cache::print_path(&cache_dir);
                    Ok(())
                }
            }
        }

        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
            Ok(())
        }
    }
}

/// The project's cache folder when a project file is present, otherwise the
/// per-user default.
fn resolve_cache_dir(config_path: &Path) -> Result<PathBuf> {
    let from_project = if config_path.exists() {
        let BuildConfig { cache_dir, .. } = config::load_config(config_path)?;
        cache_dir
    } else {
        None
    };
    from_project
        .or_else(config::default_cache_dir)
        .context("Could not determine the cache directory")
}
