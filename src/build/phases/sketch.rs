//! Sketch phase.

use crate::build::compiler::{CompiledFile, Compiler};
use crate::config::BuildConfig;
use crate::properties::PropertyStore;
use anyhow::Result;
use std::path::PathBuf;

/// Compiles the sketch's top-level files into `<build>/sketch` and its
/// `src/` tree, if any, into `<build>/sketch/src`.
pub fn build_sketch(
    config: &BuildConfig,
    props: &PropertyStore,
    compiler: &Compiler,
    includes: &[PathBuf],
) -> Result<Vec<CompiledFile>> {
    let build_dir = config.build_path.join("sketch");
    let mut includes = includes.to_vec();
    includes.push(config.sketch_dir.clone());

    let mut compiled =
        compiler.compile_files(&config.sketch_dir, false, &build_dir, props, &includes)?;

    let src = config.sketch_dir.join("src");
    if src.is_dir() {
        let src_build = build_dir.join("src");
        compiled.extend(compiler.compile_files(&src, true, &src_build, props, &includes)?);
    }
    Ok(compiled)
}
