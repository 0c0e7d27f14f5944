//! Core cache management for `skf cache`.
//!
//! The cache directory holds one `core_<board>_<hash>.a` per board and core
//! location, shared by every sketch built for that board.
//!
//! ## Commands
//!
//! - `skf cache path` - Print cache directory location
//! - `skf cache ls` - List cached cores
//! - `skf cache clean` - Remove all cached cores

use crate::ui;
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCoreEntry {
    pub path: PathBuf,
    pub size: u64,
}

/// Cached core archives in `cache_dir`, sorted by name.
pub fn cached_cores(cache_dir: &Path) -> Result<Vec<CachedCoreEntry>> {
    if !cache_dir.exists() {
        return Ok(Vec::new());
    }
    let mut cores = Vec::new();
    for entry in fs::read_dir(cache_dir)
        .with_context(|| format!("Failed to read {}", cache_dir.display()))?
        .flatten()
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.starts_with("core_") && name.ends_with(".a")) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        cores.push(CachedCoreEntry {
            path: entry.path(),
            size,
        });
    }
    cores.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(cores)
}

pub fn print_path(cache_dir: &Path) {
    println!("{}", cache_dir.display());
}

pub fn list(cache_dir: &Path) -> Result<()> {
    let cores = cached_cores(cache_dir)?;
    if cores.is_empty() {
        println!("{} Cache is empty.", "ℹ".blue());
        return Ok(());
    }

    let mut table = ui::Table::new(&["Cached Core", "Size"]);
    for core in &cores {
        let name = core
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        table.add_row(vec![name, format!("{:.1} KiB", core.size as f64 / 1024.0)]);
    }
    table.print();
    Ok(())
}

/// Removes every cached core; other files in the folder are left alone.
pub fn clean(cache_dir: &Path) -> Result<usize> {
    let cores = cached_cores(cache_dir)?;
    if cores.is_empty() {
        println!("{} Cache already empty.", "✓".green());
        return Ok(0);
    }

    println!("{} Cleaning core cache...", "🧹".yellow());
    for core in &cores {
        fs::remove_file(&core.path)
            .with_context(|| format!("Failed to remove {}", core.path.display()))?;
    }
    println!("{} Removed {} cached cores.", "✓".green(), cores.len());
    Ok(cores.len())
}
