//! `build.options.json`: wipes the build directory when the inputs that
//! every object depends on change between builds.

use super::archive::dir_content_is_older_than;
use anyhow::{Context, Result};
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const BUILD_OPTIONS_FILE: &str = "build.options.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    pub fqbn: String,
    pub sketch_location: String,
    pub build_core_path: String,
    pub property_files: Vec<String>,
    pub libraries: Vec<String>,
    pub custom_build_properties: Vec<String>,
    #[serde(rename = "compiler.optimization_flags")]
    pub compiler_optimization_flags: String,
}

impl BuildOptions {
    /// Equal, except that a sketch moved to another folder under the same
    /// name still counts as the same sketch.
    pub fn equivalent(&self, previous: &BuildOptions) -> bool {
        if file_name(&self.sketch_location) == file_name(&previous.sketch_location) {
            let mut current = self.clone();
            current.sketch_location = previous.sketch_location.clone();
            current == *previous
        } else {
            self == previous
        }
    }
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Wipes `build_path` when `clean` is set, the previous options file is
/// invalid, the options differ, or a `.txt` build-rule file under the core
/// trees is newer than the options file. Returns whether it wiped.
pub fn wipe_build_path_if_options_changed(
    build_path: &Path,
    current: &BuildOptions,
    clean: bool,
    core_root: &Path,
    referenced_core: Option<&Path>,
) -> Result<bool> {
    if clean {
        wipe_build_path(build_path)?;
        return Ok(true);
    }

    let json_path = build_path.join(BUILD_OPTIONS_FILE);
    let previous = match fs::read_to_string(&json_path) {
        Ok(s) if !s.trim().is_empty() => s,
        _ => return Ok(false),
    };

    let previous: BuildOptions = match serde_json::from_str(&previous) {
        Ok(opts) => opts,
        Err(e) => {
            println!("{} {} invalid, rebuilding all", "!".yellow(), BUILD_OPTIONS_FILE);
            tracing::debug!("{}: {}", json_path.display(), e);
            wipe_build_path(build_path)?;
            return Ok(true);
        }
    };

    if current.equivalent(&previous) {
        let older = |dir: &Path| {
            dir_content_is_older_than(dir, &json_path, &["txt"]).unwrap_or(false)
        };
        let mut unchanged = older(core_root);
        if unchanged && let Some(referenced) = referenced_core.filter(|r| *r != core_root) {
            unchanged = older(referenced);
        }
        if unchanged {
            return Ok(false);
        }
        tracing::debug!("platform files changed since last build");
    } else {
        tracing::debug!(?previous, ?current, "build options changed");
    }

    println!("{} Build options changed, rebuilding all", "!".yellow());
    wipe_build_path(build_path)?;
    Ok(true)
}

pub fn write_build_options(build_path: &Path, options: &BuildOptions) -> Result<()> {
    let json = serde_json::to_string_pretty(options)?;
    let path = build_path.join(BUILD_OPTIONS_FILE);
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn wipe_build_path(build_path: &Path) -> Result<()> {
    if build_path.exists() {
        fs::remove_dir_all(build_path)
            .with_context(|| format!("Failed to clean build path {}", build_path.display()))?;
    }
    fs::create_dir_all(build_path)
        .with_context(|| format!("Failed to create build path {}", build_path.display()))
}
