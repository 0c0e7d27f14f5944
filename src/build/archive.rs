//! Static archives and the cross-build core cache.
//!
//! Archives are built one object per archiver invocation through
//! `recipe.ar.pattern`. A compiled core is also copied into a cache directory
//! under a name derived from the board and the absolute core location, so
//! other sketches for the same board skip compiling it.

use super::compiler::find_files_in_folder;
use super::recipe::{ExecContext, OutputMode, exec_recipe};
use crate::keys;
use crate::properties::PropertyStore;
use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Longer cache names are hashed once more.
const MAX_CACHE_NAME_LENGTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    /// False when the existing archive was newer than every object.
    pub rebuilt: bool,
}

/// Creates or refreshes `<build_path>/<archive_name>` from `objects`.
///
/// An existing archive is kept if every object is older than it; otherwise
/// it is deleted and rebuilt from scratch.
pub fn archive_compiled_files(
    build_path: &Path,
    archive_name: &str,
    objects: &[PathBuf],
    props: &PropertyStore,
    ctx: &ExecContext,
) -> Result<Archive> {
    let archive_path = build_path.join(archive_name);

    if let Ok(archive_mtime) = mtime(&archive_path) {
        let stale = objects
            .iter()
            .any(|obj| mtime(obj).map_or(true, |t| t > archive_mtime));
        if !stale {
            tracing::debug!(archive = %archive_path.display(), "archive up to date");
            return Ok(Archive {
                path: archive_path,
                rebuilt: false,
            });
        }
        fs::remove_file(&archive_path)
            .with_context(|| format!("Failed to remove {}", archive_path.display()))?;
    }

    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for object in objects {
        let mut local = props.clone();
        local.set(keys::ARCHIVE_FILE, file_name.as_str());
        local.set_path(keys::ARCHIVE_FILE_PATH, &archive_path);
        local.set_path(keys::OBJECT_FILE, object);

        exec_recipe(
            &local,
            keys::RECIPE_AR_PATTERN,
            false,
            OutputMode::ShowIfVerbose,
            OutputMode::Show,
            ctx,
        )
        .with_context(|| {
            format!("Failed to add {} to {}", object.display(), archive_path.display())
        })?;
    }

    Ok(Archive {
        path: archive_path,
        rebuilt: true,
    })
}

/// `core_<fqbn>_<md5(abs core root + optimisation flags)>.a`, with `:` and
/// `=` in the FQBN replaced by `_`.
pub fn core_cache_file_name(fqbn: &str, optimization_flags: &str, core_root: &Path) -> String {
    let sanitized = fqbn.replace([':', '='], "_");
    let absolute = std::path::absolute(core_root).unwrap_or_else(|_| core_root.to_path_buf());
    let hash = md5_hex(&format!("{}{}", absolute.display(), optimization_flags));

    let mut name = format!("{}_{}", sanitized, hash);
    if name.len() > MAX_CACHE_NAME_LENGTH {
        name = md5_hex(&name);
    }
    format!("core_{}.a", name)
}

fn md5_hex(data: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Location and usability of a cached core archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCore {
    pub path: PathBuf,
    pub valid: bool,
}

/// Looks up the cache entry for a core. It is valid only if it exists and
/// nothing under `core_root` (or `referenced_core`) is newer.
pub fn resolve_cached_core(
    cache_dir: &Path,
    fqbn: &str,
    optimization_flags: &str,
    core_root: &Path,
    referenced_core: Option<&Path>,
) -> CachedCore {
    let path = cache_dir.join(core_cache_file_name(fqbn, optimization_flags, core_root));
    let valid = !core_or_referenced_core_has_changed(core_root, referenced_core, &path);
    CachedCore { path, valid }
}

/// True when `target` is missing, or a file under `core` (then under
/// `referenced_core`, when it is a different tree) is newer than it or
/// cannot be checked.
pub fn core_or_referenced_core_has_changed(
    core: &Path,
    referenced_core: Option<&Path>,
    target: &Path,
) -> bool {
    if !target.exists() {
        return true;
    }
    if !dir_content_is_older_than(core, target, &[]).unwrap_or(false) {
        return true;
    }
    match referenced_core {
        Some(referenced) if !same_location(core, referenced) => {
            core_or_referenced_core_has_changed(referenced, None, target)
        }
        _ => false,
    }
}

/// True when every file under `dir` with one of `extensions` (all files if
/// empty) is not newer than `target`.
pub fn dir_content_is_older_than(
    dir: &Path,
    target: &Path,
    extensions: &[&str],
) -> Result<bool> {
    let target_mtime =
        mtime(target).with_context(|| format!("Failed to stat {}", target.display()))?;
    for file in find_files_in_folder(dir, true, extensions)? {
        let file_mtime =
            mtime(&file).with_context(|| format!("Failed to stat {}", file.display()))?;
        if file_mtime > target_mtime {
            tracing::debug!(
                file = %file.display(),
                target = %target.display(),
                "newer than target"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Copies a freshly built core archive into the cache.
pub fn store_cached_core(archive: &Path, cached: &Path) -> Result<()> {
    if let Some(parent) = cached.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(archive, cached).with_context(|| {
        format!("Failed to copy {} to {}", archive.display(), cached.display())
    })?;
    Ok(())
}

fn same_location(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn mtime(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}
