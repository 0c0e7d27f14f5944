//! Libraries imported by a sketch.
//!
//! Two layouts exist: a `src/` folder compiled recursively, or sources in the
//! library root (flat) with an optional `utility/` folder beside them.

use crate::properties::PropertyStore;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const LIBRARY_PROPERTIES_FILE: &str = "library.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryLayout {
    Flat,
    Recursive,
}

#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    /// Folder name; also the library's build subfolder.
    pub dir_name: String,
    pub install_dir: PathBuf,
    pub source_dir: PathBuf,
    pub utility_dir: Option<PathBuf>,
    pub layout: LibraryLayout,
    pub precompiled: bool,
    /// Recursive libraries only: link through `<name>.a` instead of loose
    /// objects.
    pub dot_a_linkage: bool,
    pub ldflags: String,
}

impl Library {
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("Library folder {} not found", dir.display());
        }
        let props = PropertyStore::safe_load(&dir.join(LIBRARY_PROPERTIES_FILE))
            .with_context(|| format!("Failed to read library in {}", dir.display()))?;

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "library".to_string());
        let name = props
            .get("name")
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| dir_name.clone());

        let src = dir.join("src");
        let (layout, source_dir, utility_dir) = if src.is_dir() {
            (LibraryLayout::Recursive, src, None)
        } else {
            let utility = dir.join("utility");
            (
                LibraryLayout::Flat,
                dir.to_path_buf(),
                utility.is_dir().then_some(utility),
            )
        };

        let precompiled = matches!(props.get("precompiled"), Some("true" | "full"));
        let dot_a_linkage =
            layout == LibraryLayout::Recursive && props.get("dot_a_linkage") == Some("true");

        Ok(Self {
            name,
            dir_name,
            install_dir: dir.to_path_buf(),
            source_dir,
            utility_dir,
            layout,
            precompiled,
            dot_a_linkage,
            ldflags: props.get("ldflags").unwrap_or_default().to_string(),
        })
    }

    /// Folders added to every compile's include path.
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        vec![self.source_dir.clone()]
    }
}
