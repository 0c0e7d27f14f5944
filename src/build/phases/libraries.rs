//! Libraries phase.
//!
//! Precompiled libraries contribute linker flags and archives found under
//! `src/<mcu>[/<fpu>-<float-abi>]`; everything else is compiled from source
//! into `<build>/libraries/<folder>`.

use crate::build::archive::archive_compiled_files;
use crate::build::compiler::{CompiledFile, Compiler, objects};
use crate::build::recipe::prepare_command_for_recipe;
use crate::config::BuildConfig;
use crate::keys;
use crate::library::{Library, LibraryLayout};
use crate::logging;
use crate::properties::PropertyStore;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct LibrariesOutput {
    /// Objects and archives to link, in library order.
    pub objects: Vec<PathBuf>,
    pub compiled: Vec<CompiledFile>,
    /// New value for `compiler.libraries.ldflags` when a precompiled
    /// library added to it.
    pub ldflags: Option<String>,
}

pub fn build_libraries(
    config: &BuildConfig,
    props: &PropertyStore,
    compiler: &Compiler,
    libraries: &[Library],
    includes: &[PathBuf],
) -> Result<LibrariesOutput> {
    let mut out = LibrariesOutput::default();
    let mut ldflags: Option<String> = None;

    for library in libraries {
        compiler.context().cancel.check()?;
        let build_dir = config.build_path.join("libraries").join(&library.dir_name);
        fs::create_dir_all(&build_dir)
            .with_context(|| format!("Failed to create {}", build_dir.display()))?;

        if library.precompiled {
            if !props.contains_key(keys::COMPILER_LIBRARIES_LDFLAGS) {
                logging::warn(format!(
                    "Library {} has been declared precompiled but the platform does not \
                     support it, compiling from source",
                    library.name
                ));
            } else if let Some(folder) = find_expected_precompiled_lib_folder(library, props) {
                logging::verbose(
                    compiler.context().verbose,
                    format!("Using precompiled library in {}", folder.display()),
                );
                let current = ldflags.take().unwrap_or_else(|| {
                    props
                        .get(keys::COMPILER_LIBRARIES_LDFLAGS)
                        .unwrap_or_default()
                        .to_string()
                });
                let (flags, archives) = precompiled_link_inputs(library, &folder, &current)?;
                ldflags = Some(flags);
                out.objects.extend(archives);
                continue;
            }
        }

        let compiled = compile_library(library, &build_dir, props, compiler, includes)?;
        if library.dot_a_linkage {
            let archive = archive_compiled_files(
                &build_dir,
                &format!("{}.a", library.name),
                &objects(&compiled),
                props,
                compiler.context(),
            )?;
            out.objects.push(archive.path);
        } else {
            out.objects.extend(objects(&compiled));
        }
        out.compiled.extend(compiled);
    }

    out.ldflags = ldflags;
    Ok(out)
}

fn compile_library(
    library: &Library,
    build_dir: &Path,
    props: &PropertyStore,
    compiler: &Compiler,
    includes: &[PathBuf],
) -> Result<Vec<CompiledFile>> {
    if library.layout == LibraryLayout::Recursive {
        return compiler.compile_files(&library.source_dir, true, build_dir, props, includes);
    }

    let mut includes = includes.to_vec();
    if let Some(utility) = &library.utility_dir {
        includes.push(utility.clone());
    }
    let mut compiled =
        compiler.compile_files(&library.source_dir, false, build_dir, props, &includes)?;
    if let Some(utility) = &library.utility_dir {
        compiled.extend(compiler.compile_files(
            utility,
            false,
            &build_dir.join("utility"),
            props,
            &includes,
        )?);
    }
    Ok(compiled)
}

/// `src/<mcu>/<fpu>-<float-abi>` when the C++ recipe selects an FPU,
/// otherwise `src/<mcu>`; `None` when the folder does not exist.
pub fn find_expected_precompiled_lib_folder(
    library: &Library,
    props: &PropertyStore,
) -> Option<PathBuf> {
    let mcu = props.get(keys::BUILD_MCU).unwrap_or_default();
    let mcu_dir = library.source_dir.join(mcu);

    let fpu_specs = prepare_command_for_recipe(props, keys::RECIPE_CPP_O_PATTERN, true)
        .map(|cmd| fpu_specs(&cmd.args))
        .unwrap_or_default();

    if !fpu_specs.is_empty() {
        let dir = mcu_dir.join(&fpu_specs);
        if dir.exists() {
            return Some(dir);
        }
        tracing::debug!(dir = %dir.display(), "precompiled library folder not found");
        return None;
    }
    if !mcu.is_empty() && mcu_dir.exists() {
        return Some(mcu_dir);
    }
    tracing::debug!(dir = %mcu_dir.display(), "precompiled library folder not found");
    None
}

/// `<fpu>-<float-abi>` from `-mfpu=` / `-mfloat-abi=` arguments.
fn fpu_specs(args: &[String]) -> String {
    let mut specs = Vec::new();
    for arg in args {
        if let Some(v) = arg.split_once("-mfpu=").map(|(_, v)| v) {
            specs.push(v.replace('"', ""));
        }
        if let Some(v) = arg.split_once("-mfloat-abi=").map(|(_, v)| v) {
            specs.push(v.replace('"', ""));
        }
    }
    specs.join("-")
}

/// Appends `"-L<folder>" -l<name>...` plus the library's own ldflags to
/// `current`, and lists the `.a` files without a `lib` prefix, which `-l`
/// cannot reach.
fn precompiled_link_inputs(
    library: &Library,
    folder: &Path,
    current: &str,
) -> Result<(String, Vec<PathBuf>)> {
    let mut entries: Vec<PathBuf> = fs::read_dir(folder)
        .with_context(|| format!("Failed to read {}", folder.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut libs_cmd = format!("{} ", library.ldflags);
    let mut archives = Vec::new();
    for entry in &entries {
        let ext = entry.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if ext != "a" && ext != "so" {
            continue;
        }
        let stem = entry.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        match stem.strip_prefix("lib") {
            Some(name) => {
                libs_cmd.push_str(&format!("-l{} ", name));
            }
            None if ext == "a" => archives.push(entry.clone()),
            None => {}
        }
    }

    let flags = format!("{} \"-L{}\" {} ", current, folder.display(), libs_cmd);
    Ok((flags, archives))
}
