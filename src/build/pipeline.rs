//! The build pipeline: core, libraries, sketch, link, objcopy, size.
//!
//! [`Builder`] owns the configuration and the merged property store; each
//! phase gets them by reference and hands its results back here.

use super::cancel::CancelToken;
use super::compdb::CompilationDatabase;
use super::compiler::{CompiledFile, Compiler, objects};
use super::options::{BuildOptions, wipe_build_path_if_options_changed, write_build_options};
use super::phases::core::{CoreOutput, build_core, core_includes};
use super::phases::libraries::build_libraries;
use super::phases::linker::link;
use super::phases::sizer::{SizeReport, check_size};
use super::phases::sketch::build_sketch;
use super::phases::{run_hooks, run_recipes};
use super::recipe::ExecContext;
use crate::config::BuildConfig;
use crate::keys;
use crate::library::Library;
use crate::logging;
use crate::properties::{PropertyStore, os_suffix};
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Reported as `runtime.ide.version` for platforms that test it.
const IDE_VERSION: &str = "10607";

pub const COMPILE_COMMANDS_FILE: &str = "compile_commands.json";

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub core_archive: PathBuf,
    pub core_from_cache: bool,
    /// Core and variant sources.
    pub core_files: Vec<CompiledFile>,
    pub library_files: Vec<CompiledFile>,
    pub sketch_files: Vec<CompiledFile>,
    pub size: SizeReport,
    pub elapsed: Duration,
}

impl BuildSummary {
    pub fn all_files(&self) -> impl Iterator<Item = &CompiledFile> {
        self.core_files
            .iter()
            .chain(&self.library_files)
            .chain(&self.sketch_files)
    }

    /// Sources actually handed to the compiler in this build.
    pub fn recompiled(&self) -> usize {
        self.all_files().filter(|f| f.recompiled).count()
    }
}

pub struct Builder {
    config: BuildConfig,
    props: PropertyStore,
    cancel: CancelToken,
}

impl Builder {
    /// Loads the property files in order and injects the runtime properties
    /// derived from `config`; `extra_properties` are applied last.
    pub fn new(config: BuildConfig) -> Result<Self> {
        let config = absolutize(config)?;

        let mut props = PropertyStore::new();
        for file in &config.property_files {
            let loaded = PropertyStore::load(file)
                .with_context(|| format!("Failed to load properties from {}", file.display()))?;
            props.merge(&loaded);
        }

        props.set_path(keys::BUILD_PATH, &config.build_path);
        props.set_path(keys::BUILD_CORE_PATH, &config.core_path);
        match &config.variant_path {
            Some(variant) => props.set_path(keys::BUILD_VARIANT_PATH, variant),
            None => props.set(keys::BUILD_VARIANT_PATH, ""),
        }
        props.set_path(keys::BUILD_SOURCE_PATH, &config.sketch_dir);
        props.set(keys::BUILD_FQBN, config.fqbn.as_str());
        props.set(keys::BUILD_PROJECT_NAME, config.project_name());
        props.set(keys::BUILD_ARCH, fqbn_arch(&config.fqbn).to_uppercase());
        props.set_path(keys::RUNTIME_PLATFORM_PATH, config.core_root());
        props.set(keys::RUNTIME_OS, os_suffix()?);
        props.set(keys::RUNTIME_IDE_VERSION, IDE_VERSION);

        for extra in &config.extra_properties {
            let (key, value) = extra.split_once('=').with_context(|| {
                format!("Invalid property override '{}' (expected key=value)", extra)
            })?;
            props.set(key.trim(), value.trim());
        }

        Ok(Self {
            config,
            props,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.props
    }

    /// Cancelling this token stops the build and kills running tools.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn build(&self) -> Result<BuildSummary> {
        let start_time = Instant::now();
        let config = &self.config;
        let build_path = &config.build_path;

        println!(
            "{} Building {} for {}",
            "🔨".cyan(),
            config.project_name().bold(),
            config.fqbn
        );

        fs::create_dir_all(build_path)
            .with_context(|| format!("Failed to create build path {}", build_path.display()))?;
        let options = self.build_options();
        wipe_build_path_if_options_changed(
            build_path,
            &options,
            config.clean,
            config.core_root(),
            config.referenced_core_path.as_deref(),
        )?;
        write_build_options(build_path, &options)?;

        let cancel = match config.timeout {
            Some(timeout) => self.cancel.child_with_timeout(timeout),
            None => self.cancel.child(),
        };
        let ctx = ExecContext::new(config.verbose, cancel);
        let compiler = Compiler::new(config.jobs, &config.warnings, ctx.clone(), config.progress);
        let mut props = self.props.clone();

        run_hooks(&props, "prebuild", &ctx)?;

        let libraries = config
            .libraries
            .iter()
            .map(|dir| Library::load(dir))
            .collect::<Result<Vec<_>>>()?;
        let mut includes = core_includes(config);
        includes.extend(libraries.iter().flat_map(Library::include_dirs));

        // Core
        logging::step("Compiling core...");
        run_hooks(&props, "core.prebuild", &ctx)?;
        let core = build_core(config, &props, &compiler).context("Error compiling core")?;
        run_hooks(&props, "core.postbuild", &ctx)?;

        // Libraries
        if !libraries.is_empty() {
            logging::step(format!("Compiling {} libraries...", libraries.len()));
        }
        run_hooks(&props, "libraries.prebuild", &ctx)?;
        let libs = build_libraries(config, &props, &compiler, &libraries, &includes)
            .context("Error compiling libraries")?;
        if let Some(ldflags) = &libs.ldflags {
            props.set(keys::COMPILER_LIBRARIES_LDFLAGS, ldflags.as_str());
        }
        run_hooks(&props, "libraries.postbuild", &ctx)?;

        // Sketch
        logging::step("Compiling sketch...");
        run_hooks(&props, "sketch.prebuild", &ctx)?;
        let sketch = build_sketch(config, &props, &compiler, &includes)
            .context("Error compiling sketch")?;
        run_hooks(&props, "sketch.postbuild", &ctx)?;

        // Link
        println!("   {} Linking...", "🔗".cyan());
        run_hooks(&props, "linking.prelink", &ctx)?;
        let mut link_objects = objects(&sketch);
        link_objects.extend(libs.objects.iter().cloned());
        link_objects.extend(objects(&core.variant_objects));
        link(&props, build_path, &link_objects, &core.archive, &config.warnings, &ctx)?;
        run_hooks(&props, "linking.postlink", &ctx)?;

        run_hooks(&props, "objcopy.preobjcopy", &ctx)?;
        run_recipes(&props, keys::RECIPE_OBJCOPY_PREFIX, keys::PATTERN_SUFFIX, &ctx)?;
        run_hooks(&props, "objcopy.postobjcopy", &ctx)?;

        let CoreOutput {
            archive,
            from_cache,
            variant_objects,
            core_objects,
        } = core;
        let mut core_files = core_objects;
        core_files.extend(variant_objects);

        let mut compdb = CompilationDatabase::new(build_path.join(COMPILE_COMMANDS_FILE));
        compdb.extend(core_files.iter().chain(&libs.compiled).chain(&sketch));
        compdb.save()?;

        let size = check_size(&props, &config.warnings, &ctx)?;

        run_hooks(&props, "postbuild", &ctx)?;

        let summary = BuildSummary {
            core_archive: archive,
            core_from_cache: from_cache,
            core_files,
            library_files: libs.compiled,
            sketch_files: sketch,
            size,
            elapsed: start_time.elapsed(),
        };
        tracing::debug!(recompiled = summary.recompiled(), "build done");
        println!("{} Build finished in {:.2?}", "✓".green(), summary.elapsed);
        Ok(summary)
    }

    fn build_options(&self) -> BuildOptions {
        let config = &self.config;
        let path_list = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        };
        BuildOptions {
            fqbn: config.fqbn.clone(),
            sketch_location: config.sketch_dir.to_string_lossy().into_owned(),
            build_core_path: config.core_path.to_string_lossy().into_owned(),
            property_files: path_list(&config.property_files),
            libraries: path_list(&config.libraries),
            custom_build_properties: config.extra_properties.clone(),
            compiler_optimization_flags: self
                .props
                .get(keys::COMPILER_OPTIMIZATION_FLAGS)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Architecture part of `vendor:arch:board[:options]`.
fn fqbn_arch(fqbn: &str) -> &str {
    fqbn.split(':').nth(1).unwrap_or_default()
}

fn absolutize(mut config: BuildConfig) -> Result<BuildConfig> {
    fn abs(path: &Path) -> Result<PathBuf> {
        std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))
    }
    fn abs_opt(path: &Option<PathBuf>) -> Result<Option<PathBuf>> {
        path.as_deref().map(abs).transpose()
    }

    config.sketch_dir = abs(&config.sketch_dir)?;
    config.build_path = abs(&config.build_path)?;
    config.core_path = abs(&config.core_path)?;
    config.cache_dir = abs_opt(&config.cache_dir)?;
    config.variant_path = abs_opt(&config.variant_path)?;
    config.platform_path = abs_opt(&config.platform_path)?;
    config.referenced_core_path = abs_opt(&config.referenced_core_path)?;
    config.property_files = config
        .property_files
        .iter()
        .map(|p| abs(p))
        .collect::<Result<_>>()?;
    config.libraries = config.libraries.iter().map(|p| abs(p)).collect::<Result<_>>()?;
    Ok(config)
}
