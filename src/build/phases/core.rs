//! Core phase: the platform core and board variant.
//!
//! The variant is compiled on every build. The core is served from the
//! cross-build cache when possible, otherwise compiled, archived into
//! `<build>/core.a` and copied into the cache.

use crate::build::archive::{archive_compiled_files, resolve_cached_core, store_cached_core};
use crate::build::compiler::{CompiledFile, Compiler};
use crate::config::BuildConfig;
use crate::keys;
use crate::logging;
use crate::properties::PropertyStore;
use anyhow::Result;
use std::path::PathBuf;

pub const CORE_ARCHIVE: &str = "core.a";

#[derive(Debug, Clone)]
pub struct CoreOutput {
    /// Archive to link: the cached copy when `from_cache`, else the build's.
    pub archive: PathBuf,
    pub from_cache: bool,
    /// Linked as loose objects next to the archive.
    pub variant_objects: Vec<CompiledFile>,
    /// Empty when the core came from the cache.
    pub core_objects: Vec<CompiledFile>,
}

/// Include folders for core and variant compilation.
pub fn core_includes(config: &BuildConfig) -> Vec<PathBuf> {
    let mut includes = vec![config.core_path.clone()];
    if let Some(variant) = config.variant_path.as_ref().filter(|v| v.is_dir()) {
        includes.push(variant.clone());
    }
    includes
}

pub fn build_core(
    config: &BuildConfig,
    props: &PropertyStore,
    compiler: &Compiler,
) -> Result<CoreOutput> {
    let includes = core_includes(config);
    let verbose = compiler.context().verbose;

    let variant_objects = match config.variant_path.as_ref().filter(|v| v.is_dir()) {
        Some(variant) => compiler.compile_files(
            variant,
            false,
            &config.build_path.join("variant"),
            props,
            &includes,
        )?,
        None => Vec::new(),
    };

    let cached = config.cache_dir.as_ref().map(|cache_dir| {
        resolve_cached_core(
            cache_dir,
            &config.fqbn,
            props.get(keys::COMPILER_OPTIMIZATION_FLAGS).unwrap_or_default(),
            config.core_root(),
            config.referenced_core_path.as_deref(),
        )
    });

    if let Some(cached) = cached.as_ref().filter(|c| c.valid && !config.clean) {
        tracing::debug!(archive = %cached.path.display(), "core cache hit");
        logging::verbose(
            verbose,
            format!("Using precompiled core: {}", cached.path.display()),
        );
        return Ok(CoreOutput {
            archive: cached.path.clone(),
            from_cache: true,
            variant_objects,
            core_objects: Vec::new(),
        });
    }

    let core_objects = compiler.compile_files(
        &config.core_path,
        true,
        &config.build_path.join("core"),
        props,
        &includes,
    )?;

    let objects: Vec<PathBuf> = core_objects.iter().map(|f| f.object.clone()).collect();
    let archive = archive_compiled_files(
        &config.build_path,
        CORE_ARCHIVE,
        &objects,
        props,
        compiler.context(),
    )?;
    if !archive.rebuilt {
        logging::verbose(
            verbose,
            format!("Using previously compiled file: {}", archive.path.display()),
        );
    }

    if let Some(cached) = &cached {
        match store_cached_core(&archive.path, &cached.path) {
            Ok(()) => logging::verbose(
                verbose,
                format!("Archiving built core (caching) in: {}", cached.path.display()),
            ),
            Err(e) => {
                tracing::warn!("core not cached: {:#}", e);
                logging::verbose(verbose, format!("Error archiving built core (caching): {:#}", e));
            }
        }
    }

    Ok(CoreOutput {
        archive: archive.path,
        from_cache: false,
        variant_objects,
        core_objects,
    })
}
