//! Build phases, run in order by the pipeline.
//!
//! Each phase reads the immutable build configuration and property store and
//! returns its own results; only the pipeline writes shared state.

pub mod core;
pub mod libraries;
pub mod linker;
pub mod sizer;
pub mod sketch;

use super::recipe::{ExecContext, OutputMode, exec_recipe};
use crate::keys;
use crate::properties::PropertyStore;
use anyhow::{Context, Result};

/// Hook stages a platform can attach `recipe.hooks.<stage>.<NN>.pattern`
/// commands to.
pub const HOOK_STAGES: &[&str] = &[
    "prebuild",
    "core.prebuild",
    "core.postbuild",
    "libraries.prebuild",
    "libraries.postbuild",
    "sketch.prebuild",
    "sketch.postbuild",
    "linking.prelink",
    "linking.postlink",
    "objcopy.preobjcopy",
    "objcopy.postobjcopy",
    "postbuild",
];

/// Non-empty recipes named `<prefix>*<suffix>`, sorted by key.
pub fn recipes_by_prefix_suffix(props: &PropertyStore, prefix: &str, suffix: &str) -> Vec<String> {
    let mut recipes: Vec<String> = props
        .iter()
        .filter(|(key, value)| {
            key.starts_with(prefix) && key.ends_with(suffix) && !value.is_empty()
        })
        .map(|(key, _)| key.to_string())
        .collect();
    recipes.sort();
    recipes
}

/// Runs every recipe matching `prefix`/`suffix` in key order.
pub fn run_recipes(
    props: &PropertyStore,
    prefix: &str,
    suffix: &str,
    ctx: &ExecContext,
) -> Result<()> {
    for recipe in recipes_by_prefix_suffix(props, prefix, suffix) {
        tracing::debug!(%recipe, "running");
        exec_recipe(props, &recipe, false, OutputMode::ShowIfVerbose, OutputMode::Show, ctx)
            .with_context(|| format!("Failed to run {}", recipe))?;
    }
    Ok(())
}

/// Runs the hooks of one stage, e.g. `sketch.prebuild`.
pub fn run_hooks(props: &PropertyStore, stage: &str, ctx: &ExecContext) -> Result<()> {
    let prefix = format!("{}{}.", keys::RECIPE_HOOKS_PREFIX, stage);
    run_recipes(props, &prefix, keys::PATTERN_SUFFIX, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_selection_is_sorted_and_scoped() {
        let mut props = PropertyStore::new();
        props.set("recipe.hooks.prebuild.2.pattern", "echo two");
        props.set("recipe.hooks.prebuild.1.pattern", "echo one");
        props.set("recipe.hooks.prebuild.3.pattern", "");
        props.set("recipe.hooks.sketch.prebuild.1.pattern", "echo sketch");
        props.set("recipe.hooks.prebuild.1.other", "ignored");

        let prefix = format!("{}prebuild.", keys::RECIPE_HOOKS_PREFIX);
        assert_eq!(
            recipes_by_prefix_suffix(&props, &prefix, keys::PATTERN_SUFFIX),
            vec!["recipe.hooks.prebuild.1.pattern", "recipe.hooks.prebuild.2.pattern"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_run_hooks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("hooks.log");
        let log_str = log.to_string_lossy().to_string();

        let mut props = PropertyStore::new();
        props.set("log", log_str.as_str());
        props.set("recipe.hooks.postbuild.02.pattern", "sh -c 'echo second >> \"$0\"' {log}");
        props.set("recipe.hooks.postbuild.01.pattern", "sh -c 'echo first >> \"$0\"' {log}");

        run_hooks(&props, "postbuild", &ExecContext::default()).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_hook_names_recipe() {
        let mut props = PropertyStore::new();
        props.set("recipe.hooks.prebuild.1.pattern", "sh -c 'exit 2'");
        let err = run_hooks(&props, "prebuild", &ExecContext::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("recipe.hooks.prebuild.1.pattern"));
    }
}
