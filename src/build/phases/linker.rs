//! Link phase.

use crate::build::archive::archive_compiled_files;
use crate::build::compiler::apply_warning_level;
use crate::build::recipe::{ExecContext, MAX_COMMAND_LINE_LENGTH, OutputMode, exec_recipe};
use crate::keys;
use crate::properties::PropertyStore;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// The MCU whose linker needs `--relax` to reach far calls.
const RELAX_MCU: &str = "atmega2560";

/// Links `objects` (sketch, then libraries, then variant) with the core
/// archive through `recipe.c.combine.pattern`.
pub fn link(
    props: &PropertyStore,
    build_path: &Path,
    objects: &[PathBuf],
    core_archive: &Path,
    warnings: &str,
    ctx: &ExecContext,
) -> Result<()> {
    let mut object_files = quoted_list(objects);

    if object_files.len() > MAX_COMMAND_LINE_LENGTH {
        tracing::debug!(len = object_files.len(), "object list too long, grouping into archives");
        let archives = group_into_archives(props, objects, ctx)?;
        object_files = format!(
            "-Wl,--whole-archive {} -Wl,--no-whole-archive",
            quoted_list(&archives)
        );
    }

    let mut local = props.clone();
    apply_warning_level(&mut local, warnings);
    if local.get(keys::BUILD_MCU) == Some(RELAX_MCU) {
        let flags = format!(
            "{},--relax",
            local.get(keys::COMPILER_C_ELF_FLAGS).unwrap_or_default()
        );
        local.set(keys::COMPILER_C_ELF_FLAGS, flags);
    }
    local.set_path(keys::ARCHIVE_FILE, &relative_path(build_path, core_archive));
    local.set_path(keys::ARCHIVE_FILE_PATH, core_archive);
    local.set(keys::OBJECT_FILES, object_files);

    exec_recipe(
        &local,
        keys::RECIPE_C_COMBINE_PATTERN,
        false,
        OutputMode::ShowIfVerbose,
        OutputMode::Show,
        ctx,
    )
    .context("Linking failed")?;
    Ok(())
}

fn quoted_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\"{}\"", p.display()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Packs the objects of each directory into `<dir>/objs.a`; archives in
/// the list are passed through untouched.
fn group_into_archives(
    props: &PropertyStore,
    objects: &[PathBuf],
    ctx: &ExecContext,
) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for object in objects {
        if object.extension().is_some_and(|e| e == "a") {
            archives.push(object.clone());
            continue;
        }
        let dir = object.parent().map(Path::to_path_buf).unwrap_or_default();
        by_dir.entry(dir).or_default().push(object.clone());
    }

    for (dir, objs) in by_dir {
        let archive = dir.join("objs.a");
        if archive.exists() {
            fs::remove_file(&archive)
                .with_context(|| format!("Failed to remove {}", archive.display()))?;
        }
        let built = archive_compiled_files(&dir, "objs.a", &objs, props, ctx)?;
        archives.push(built.path);
    }
    Ok(archives)
}

/// Path of `target` relative to `base`, walking up with `..` as needed.
/// Falls back to `target` itself when the two share no root.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target_parts: Vec<Component> = target.components().collect();

    let common = base
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && target.has_root() {
        return target.to_path_buf();
    }

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}
