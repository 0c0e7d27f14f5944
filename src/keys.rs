//! Property key names the build engine reads or writes.
//!
//! Platform property files are free-form, so the store stays a string map;
//! every key the engine itself depends on is named here once.

// Paths and identity injected by the pipeline before any phase runs.
pub const BUILD_PATH: &str = "build.path";
pub const BUILD_CORE_PATH: &str = "build.core.path";
pub const BUILD_VARIANT_PATH: &str = "build.variant.path";
pub const BUILD_SOURCE_PATH: &str = "build.source.path";
pub const BUILD_PROJECT_NAME: &str = "build.project_name";
pub const BUILD_FQBN: &str = "build.fqbn";
pub const BUILD_ARCH: &str = "build.arch";
pub const RUNTIME_PLATFORM_PATH: &str = "runtime.platform.path";
pub const RUNTIME_OS: &str = "runtime.os";
pub const RUNTIME_IDE_VERSION: &str = "runtime.ide.version";

/// Target MCU as declared by the board; drives the link quirk and the
/// precompiled library lookup.
pub const BUILD_MCU: &str = "build.mcu";

// Per-invocation overrides set on a clone before a recipe is expanded.
pub const INCLUDES: &str = "includes";
pub const SOURCE_FILE: &str = "source_file";
pub const OBJECT_FILE: &str = "object_file";
pub const OBJECT_FILES: &str = "object_files";
pub const ARCHIVE_FILE: &str = "archive_file";
pub const ARCHIVE_FILE_PATH: &str = "archive_file_path";

// Compiler flag groups.
/// Selected from `compiler.warning_flags.<level>` for every compile/link.
pub const COMPILER_WARNING_FLAGS: &str = "compiler.warning_flags";
pub const COMPILER_C_ELF_FLAGS: &str = "compiler.c.elf.flags";
pub const COMPILER_LIBRARIES_LDFLAGS: &str = "compiler.libraries.ldflags";
pub const COMPILER_OPTIMIZATION_FLAGS: &str = "compiler.optimization_flags";

// Recipes.
pub const RECIPE_S_O_PATTERN: &str = "recipe.S.o.pattern";
pub const RECIPE_C_O_PATTERN: &str = "recipe.c.o.pattern";
pub const RECIPE_CPP_O_PATTERN: &str = "recipe.cpp.o.pattern";
pub const RECIPE_AR_PATTERN: &str = "recipe.ar.pattern";
pub const RECIPE_C_COMBINE_PATTERN: &str = "recipe.c.combine.pattern";
pub const RECIPE_SIZE_PATTERN: &str = "recipe.size.pattern";
pub const RECIPE_SIZE_REGEX: &str = "recipe.size.regex";
pub const RECIPE_SIZE_REGEX_DATA: &str = "recipe.size.regex.data";
pub const RECIPE_SIZE_REGEX_EEPROM: &str = "recipe.size.regex.eeprom";

/// Hook recipes are `recipe.hooks.<stage>.<NN>.pattern`.
pub const RECIPE_HOOKS_PREFIX: &str = "recipe.hooks.";
/// Post-link conversions are `recipe.objcopy.<name>.pattern`.
pub const RECIPE_OBJCOPY_PREFIX: &str = "recipe.objcopy.";
pub const PATTERN_SUFFIX: &str = ".pattern";

// Size limits.
pub const UPLOAD_MAXIMUM_SIZE: &str = "upload.maximum_size";
pub const UPLOAD_MAXIMUM_DATA_SIZE: &str = "upload.maximum_data_size";
pub const BUILD_WARN_DATA_PERCENTAGE: &str = "build.warn_data_percentage";

/// Recipe key used to compile a source with the given extension (no dot),
/// e.g. `recipe.cpp.o.pattern`.
pub fn compile_recipe_for_extension(ext: &str) -> String {
    format!("recipe.{}.o.pattern", ext)
}
