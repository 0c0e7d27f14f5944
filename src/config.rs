//! `sketchforge.toml` and the resolved build configuration.
//!
//! Paths in the file are relative to the file's own folder.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "sketchforge.toml";

pub const WARNING_LEVELS: &[&str] = &["none", "default", "more", "all"];

#[derive(Deserialize, Debug, Default)]
pub struct ProjectConfig {
    pub board: BoardConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryEntry>,
}

#[derive(Deserialize, Debug, Default)]
pub struct BoardConfig {
    pub fqbn: String,
    /// `key=value` files, later ones overriding earlier ones.
    #[serde(default)]
    pub properties: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PathsConfig {
    pub sketch: String,
    #[serde(default = "default_build_dir")]
    pub build: String,
    pub cache: Option<String>,
    pub core: String,
    pub variant: Option<String>,
    /// Platform folder holding the core; defaults to the core itself.
    pub platform: Option<String>,
    pub referenced_core: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BuildSection {
    #[serde(default)]
    pub jobs: usize,
    #[serde(default = "default_warnings")]
    pub warnings: String,
    #[serde(default)]
    pub verbose: bool,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub extra_properties: Vec<String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            jobs: 0,
            warnings: default_warnings(),
            verbose: false,
            timeout_secs: None,
            clean: false,
            extra_properties: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct LibraryEntry {
    pub path: String,
}

fn default_build_dir() -> String {
    "build".to_string()
}

fn default_warnings() -> String {
    "default".to_string()
}

/// Everything one build needs, with absolute-or-config-relative paths
/// already resolved.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub fqbn: String,
    pub property_files: Vec<PathBuf>,
    /// `key=value` overrides applied after the property files.
    pub extra_properties: Vec<String>,
    pub sketch_dir: PathBuf,
    pub build_path: PathBuf,
    /// `None` disables the core cache.
    pub cache_dir: Option<PathBuf>,
    pub core_path: PathBuf,
    pub variant_path: Option<PathBuf>,
    pub platform_path: Option<PathBuf>,
    pub referenced_core_path: Option<PathBuf>,
    pub libraries: Vec<PathBuf>,
    /// 0 means one job per CPU.
    pub jobs: usize,
    pub warnings: String,
    pub verbose: bool,
    pub clean: bool,
    pub timeout: Option<Duration>,
    pub progress: bool,
}

impl BuildConfig {
    /// Tree whose changes invalidate the cached core and the build options.
    pub fn core_root(&self) -> &Path {
        self.platform_path.as_deref().unwrap_or(&self.core_path)
    }

    pub fn project_name(&self) -> String {
        self.sketch_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sketch".to_string())
    }
}

pub fn load_config(path: &Path) -> Result<BuildConfig> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "{} not found.\n\n💡 Tip: pass --config <path> or run from the project folder.",
            path.display()
        ));
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let project: ProjectConfig = toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse {} - check for syntax errors", path.display()))?;

    let base = path.parent().unwrap_or(Path::new("."));
    project.resolve(base)
}

impl ProjectConfig {
    pub fn resolve(self, base: &Path) -> Result<BuildConfig> {
        if self.board.fqbn.trim().is_empty() {
            anyhow::bail!("[board] fqbn must not be empty");
        }
        if !WARNING_LEVELS.contains(&self.build.warnings.as_str()) {
            anyhow::bail!(
                "Invalid warnings level '{}' (expected one of: {})",
                self.build.warnings,
                WARNING_LEVELS.join(", ")
            );
        }

        let cache_dir = match &self.paths.cache {
            Some(dir) => Some(resolve_path(base, dir)),
            None => default_cache_dir(),
        };

        Ok(BuildConfig {
            fqbn: self.board.fqbn,
            property_files: self
                .board
                .properties
                .iter()
                .map(|p| resolve_path(base, p))
                .collect(),
            extra_properties: self.build.extra_properties,
            sketch_dir: resolve_path(base, &self.paths.sketch),
            build_path: resolve_path(base, &self.paths.build),
            cache_dir,
            core_path: resolve_path(base, &self.paths.core),
            variant_path: self.paths.variant.as_deref().map(|p| resolve_path(base, p)),
            platform_path: self.paths.platform.as_deref().map(|p| resolve_path(base, p)),
            referenced_core_path: self
                .paths
                .referenced_core
                .as_deref()
                .map(|p| resolve_path(base, p)),
            libraries: self
                .libraries
                .iter()
                .map(|l| resolve_path(base, &l.path))
                .collect(),
            jobs: self.build.jobs,
            warnings: self.build.warnings,
            verbose: self.build.verbose,
            clean: self.build.clean,
            timeout: self.build.timeout_secs.map(Duration::from_secs),
            progress: true,
        })
    }
}

/// Default location of cached cores.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("sketchforge").join("cores"))
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
