//! Parallel compilation of a source tree through compile recipes.
//!
//! Each source maps to `<build_dir>/<relative source>.o` with its dependency
//! file next to it (`.d`). Sources are compiled on a bounded rayon pool; the
//! first failure cancels the remaining work and is the one reported.

use super::freshness::{self, Freshness};
use super::recipe::{
    ExecContext, OutputMode, PreparedCommand, exec_command, prepare_command_for_recipe,
};
use crate::error::BuildError;
use crate::keys;
use crate::properties::PropertyStore;
use anyhow::{Context, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use walkdir::{DirEntry, WalkDir};

/// Extensions picked up when compiling a whole tree.
pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "S", "ino"];

/// Version-control and editor metadata folders never searched for sources.
const SCCS_DIRS: &[&str] = &[
    "CVS", "RCS", ".git", ".github", ".svn", ".hg", ".bzr", ".vscode", ".settings", ".pioenvs",
    ".piolibdeps",
];

/// Result of one source file.
#[derive(Debug, Clone)]
pub struct CompiledFile {
    pub source: PathBuf,
    pub object: PathBuf,
    pub command: PreparedCommand,
    /// False when the freshness check allowed the existing object to be reused.
    pub recompiled: bool,
}

pub fn objects(files: &[CompiledFile]) -> Vec<PathBuf> {
    files.iter().map(|f| f.object.clone()).collect()
}

pub struct Compiler {
    pool: Option<rayon::ThreadPool>,
    ctx: ExecContext,
    warnings: String,
    progress: bool,
}

impl Compiler {
    /// `jobs == 0` sizes the pool to the number of CPUs.
    pub fn new(jobs: usize, warnings: &str, ctx: ExecContext, progress: bool) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("skf-compile-{}", i))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!("failed to create compile pool, compiling sequentially: {}", e);
                None
            }
        };
        let progress = progress && !ctx.verbose;
        Self {
            pool,
            ctx,
            warnings: warnings.to_string(),
            progress,
        }
    }

    pub fn context(&self) -> &ExecContext {
        &self.ctx
    }

    pub fn warnings(&self) -> &str {
        &self.warnings
    }

    /// Compiles every file with a known extension, each through the recipe
    /// for its extension.
    pub fn compile_files(
        &self,
        source_dir: &Path,
        recurse: bool,
        build_dir: &Path,
        props: &PropertyStore,
        includes: &[PathBuf],
    ) -> Result<Vec<CompiledFile>> {
        let sources = find_files_in_folder(source_dir, recurse, SOURCE_EXTENSIONS)?
            .into_iter()
            .filter_map(|src| recipe_for_source(props, &src).map(|recipe| (src, recipe)))
            .collect();
        self.compile_sources(source_dir, sources, build_dir, props, includes)
    }

    /// Compiles the files with `extension` (no dot) through `recipe`.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_files_with_recipe(
        &self,
        source_dir: &Path,
        recurse: bool,
        build_dir: &Path,
        props: &PropertyStore,
        includes: &[PathBuf],
        extension: &str,
        recipe: &str,
    ) -> Result<Vec<CompiledFile>> {
        let sources = find_files_in_folder(source_dir, recurse, &[extension])?
            .into_iter()
            .map(|src| (src, recipe.to_string()))
            .collect();
        self.compile_sources(source_dir, sources, build_dir, props, includes)
    }

    fn compile_sources(
        &self,
        source_dir: &Path,
        sources: Vec<(PathBuf, String)>,
        build_dir: &Path,
        props: &PropertyStore,
        includes: &[PathBuf],
    ) -> Result<Vec<CompiledFile>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let pb = self.progress_bar(sources.len());
        let token = self.ctx.cancel.child();
        let ctx = self.ctx.with_cancel(token.clone());
        let (tx, rx) = mpsc::channel();

        let job = |tx: &mut mpsc::Sender<Result<CompiledFile>>, (src, recipe): &(PathBuf, String)| {
            if token.is_cancelled() {
                return;
            }
            pb.set_message(file_label(src));
            let result =
                self.compile_file(source_dir, src, build_dir, props, includes, recipe, &ctx, &pb);
            if result.is_err() {
                token.cancel();
            }
            pb.inc(1);
            let _ = tx.send(result);
        };

        match &self.pool {
            Some(pool) => pool.install(|| sources.par_iter().for_each_with(tx, job)),
            None => {
                let mut tx = tx;
                sources.iter().for_each(|s| job(&mut tx, s));
            }
        }

        let mut compiled = Vec::with_capacity(sources.len());
        let mut first_error: Option<anyhow::Error> = None;
        let mut cancellation: Option<anyhow::Error> = None;
        for result in rx {
            match result {
                Ok(file) => compiled.push(file),
                Err(e) if is_cancellation(&e) => {
                    cancellation.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error.or(cancellation) {
            pb.abandon();
            return Err(e);
        }
        // Work skipped because an outer token tripped.
        self.ctx.cancel.check()?;

        pb.finish_and_clear();
        compiled.sort_by(|a, b| a.object.as_os_str().cmp(b.object.as_os_str()));
        Ok(compiled)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_file(
        &self,
        source_dir: &Path,
        source: &Path,
        build_dir: &Path,
        props: &PropertyStore,
        includes: &[PathBuf],
        recipe: &str,
        ctx: &ExecContext,
        pb: &ProgressBar,
    ) -> Result<CompiledFile> {
        let mut local = props.clone();
        apply_warning_level(&mut local, &self.warnings);
        local.set(
            keys::INCLUDES,
            includes
                .iter()
                .map(|p| wrap_with_hyphen_i(p))
                .collect::<Vec<_>>()
                .join(" "),
        );
        local.set_path(keys::SOURCE_FILE, source);

        let relative = source.strip_prefix(source_dir).with_context(|| {
            format!("{} is not inside {}", source.display(), source_dir.display())
        })?;
        let object = with_suffix(&build_dir.join(relative), ".o");
        let depfile = with_suffix(&build_dir.join(relative), ".d");
        local.set_path(keys::OBJECT_FILE, &object);

        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let freshness = freshness::check(source, Some(&object), Some(&depfile))
            .with_context(|| format!("Failed to check {}", source.display()))?;

        // Prepared even when fresh; the compilation database lists every file.
        let command = prepare_command_for_recipe(&local, recipe, true)
            .with_context(|| format!("Failed to prepare {} for {}", recipe, source.display()))?;

        let recompiled = match &freshness {
            Freshness::Stale(reason) => {
                tracing::debug!(source = %source.display(), %reason, "compiling");
                let capture = OutputMode::Capture;
                let output = exec_command(&command, recipe, capture, capture, ctx)
                    .with_context(|| format!("Error compiling {}", source.display()))?;
                report_output(pb, source, &output.stdout, &output.stderr);
                true
            }
            Freshness::UpToDate | Freshness::NothingToCheck => {
                tracing::debug!(source = %source.display(), ?freshness, "reusing object");
                if ctx.verbose {
                    pb.println(format!(
                        "{} Using previously compiled file: {}",
                        "→".dimmed(),
                        object.display()
                    ));
                }
                false
            }
        };

        Ok(CompiledFile {
            source: source.to_path_buf(),
            object,
            command,
            recompiled,
        })
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

fn report_output(pb: &ProgressBar, source: &Path, stdout: &[u8], stderr: &[u8]) {
    let stdout = String::from_utf8_lossy(stdout);
    if !stdout.trim().is_empty() {
        pb.println(stdout.trim_end().to_string());
    }
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        pb.println(format!(
            "{} Warning in {}:\n{}",
            "!".yellow(),
            source.display(),
            stderr.trim_end()
        ));
    }
}

fn is_cancellation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<BuildError>()
        .is_some_and(BuildError::is_cancellation)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Sets `compiler.warning_flags` from `compiler.warning_flags.<level>`.
pub fn apply_warning_level(props: &mut PropertyStore, level: &str) {
    let key = format!("{}.{}", keys::COMPILER_WARNING_FLAGS, level);
    if let Some(flags) = props.get(&key).map(str::to_string) {
        props.set(keys::COMPILER_WARNING_FLAGS, flags);
    }
}

/// `"-I<dir>"`, quoted so include paths may contain spaces.
pub fn wrap_with_hyphen_i(path: &Path) -> String {
    format!("\"-I{}\"", path.display())
}

/// Compile recipe for a source: `recipe.<ext>.o.pattern` when the platform
/// defines one, otherwise the recipe of the language the extension belongs to.
pub fn recipe_for_source(props: &PropertyStore, source: &Path) -> Option<String> {
    let ext = source.extension()?.to_str()?;
    let specific = keys::compile_recipe_for_extension(ext);
    if props.get(&specific).is_some_and(|p| !p.is_empty()) {
        return Some(specific);
    }
    let fallback = match ext {
        "c" => keys::RECIPE_C_O_PATTERN,
        "cpp" | "cc" | "cxx" | "ino" => keys::RECIPE_CPP_O_PATTERN,
        "S" => keys::RECIPE_S_O_PATTERN,
        _ => return None,
    };
    Some(fallback.to_string())
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SCCS_DIRS.contains(&name.as_ref()))
}

/// Files directly in `dir` (and below it when `recurse`) whose extension is
/// one of `extensions`, or all files when `extensions` is empty. Hidden
/// entries and VCS folders are skipped.
pub fn find_files_in_folder(
    dir: &Path,
    recurse: bool,
    extensions: &[&str],
) -> Result<Vec<PathBuf>> {
    let mut walker = WalkDir::new(dir).min_depth(1).sort_by_file_name();
    if !recurse {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| !is_skipped(e)) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = extensions.is_empty()
            || entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.contains(&e));
        if matches {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_find_files_skips_hidden_and_vcs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("main.cpp"), "");
        write(&root.join("util.c"), "");
        write(&root.join("notes.txt"), "");
        write(&root.join(".hidden.cpp"), "");
        write(&root.join("nested/deep.cpp"), "");
        write(&root.join(".git/obj.cpp"), "");
        write(&root.join("CVS/old.c"), "");

        let flat = find_files_in_folder(root, false, SOURCE_EXTENSIONS).unwrap();
        assert_eq!(flat, vec![root.join("main.cpp"), root.join("util.c")]);

        let all = find_files_in_folder(root, true, SOURCE_EXTENSIONS).unwrap();
        assert_eq!(
            all,
            vec![root.join("main.cpp"), root.join("nested/deep.cpp"), root.join("util.c")]
        );

        let only_c = find_files_in_folder(root, true, &["c"]).unwrap();
        assert_eq!(only_c, vec![root.join("util.c")]);
    }

    #[test]
    fn test_recipe_for_source() {
        let mut props = PropertyStore::new();
        props.set("recipe.cpp.o.pattern", "g++");
        assert_eq!(
            recipe_for_source(&props, Path::new("Blink.ino")).as_deref(),
            Some("recipe.cpp.o.pattern")
        );
        props.set("recipe.ino.o.pattern", "g++ -x c++");
        assert_eq!(
            recipe_for_source(&props, Path::new("Blink.ino")).as_deref(),
            Some("recipe.ino.o.pattern")
        );
        assert_eq!(
            recipe_for_source(&props, Path::new("start.S")).as_deref(),
            Some("recipe.S.o.pattern")
        );
        assert_eq!(recipe_for_source(&props, Path::new("README.md")), None);
    }

    #[test]
    fn test_warning_level_selection() {
        let mut props = PropertyStore::new();
        props.set("compiler.warning_flags", "-w");
        props.set("compiler.warning_flags.all", "-Wall -Wextra");
        apply_warning_level(&mut props, "all");
        assert_eq!(props.get("compiler.warning_flags"), Some("-Wall -Wextra"));
        apply_warning_level(&mut props, "unknown");
        assert_eq!(props.get("compiler.warning_flags"), Some("-Wall -Wextra"));
    }

    #[test]
    fn test_wrap_with_hyphen_i() {
        assert_eq!(
            wrap_with_hyphen_i(Path::new("/opt/core dir")),
            "\"-I/opt/core dir\""
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::build::cancel::CancelToken;
        use std::os::unix::fs::PermissionsExt;

        /// Copies the source into the object, writes a dependency file and
        /// appends the source to `compiled.log`.
        const FAKE_CC: &str = r#"#!/bin/sh
src="$1"; obj="$2"
dep=$(echo "$obj" | sed 's/\.o$/.d/')
tools=$(dirname "$0")
echo "$src" >> "$tools/compiled.log"
case "$src" in
  *slow*) sleep 20 & echo $! > "$tools/slow.pid"; wait; exit 0 ;;
  *late_fail*)
    i=0
    while [ ! -s "$tools/slow.pid" ] && [ $i -lt 200 ]; do sleep 0.05; i=$((i+1)); done
    echo "error: $src" >&2; exit 1 ;;
  *fail*) echo "error: $src" >&2; exit 1 ;;
esac
cat "$src" > "$obj"
printf '%s: \\\n %s\n' "$obj" "$src" > "$dep"
"#;

        struct Tree {
            dir: tempfile::TempDir,
            props: PropertyStore,
        }

        impl Tree {
            fn new(sources: &[&str]) -> Self {
                let dir = tempfile::tempdir().unwrap();
                let cc = dir.path().join("cc.sh");
                write(&cc, FAKE_CC);
                fs::set_permissions(&cc, fs::Permissions::from_mode(0o755)).unwrap();
                for s in sources {
                    write(&dir.path().join("src").join(s), s);
                }
                let mut props = PropertyStore::new();
                let recipe = format!(
                    "\"{}\" \"{{source_file}}\" \"{{object_file}}\" {{includes}}",
                    cc.display()
                );
                props.set("recipe.cpp.o.pattern", recipe.clone());
                props.set("recipe.c.o.pattern", recipe);
                Self { dir, props }
            }

            fn src(&self) -> PathBuf {
                self.dir.path().join("src")
            }

            fn build(&self) -> PathBuf {
                self.dir.path().join("build")
            }

            fn log_lines(&self) -> usize {
                fs::read_to_string(self.dir.path().join("compiled.log"))
                    .map(|s| s.lines().count())
                    .unwrap_or(0)
            }
        }

        fn compiler(jobs: usize) -> Compiler {
            Compiler::new(jobs, "default", ExecContext::default(), false)
        }

        #[test]
        fn test_compile_tree_and_reuse() {
            let tree = Tree::new(&["a.cpp", "b.c", "sub/c.cpp"]);
            let c = compiler(2);

            let first = c
                .compile_files(&tree.src(), true, &tree.build(), &tree.props, &[])
                .unwrap();
            assert_eq!(
                objects(&first),
                vec![
                    tree.build().join("a.cpp.o"),
                    tree.build().join("b.c.o"),
                    tree.build().join("sub/c.cpp.o"),
                ]
            );
            assert!(first.iter().all(|f| f.recompiled));
            assert_eq!(tree.log_lines(), 3);

            let second = c
                .compile_files(&tree.src(), true, &tree.build(), &tree.props, &[])
                .unwrap();
            assert!(second.iter().all(|f| !f.recompiled));
            assert_eq!(objects(&first), objects(&second));
            assert_eq!(tree.log_lines(), 3);
        }

        #[test]
        fn test_order_is_independent_of_pool_size() {
            let names: Vec<String> = (0..24).map(|i| format!("f{:02}.cpp", 23 - i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let tree = Tree::new(&refs);

            let serial = compiler(1)
                .compile_files(&tree.src(), false, &tree.build(), &tree.props, &[])
                .unwrap();
            fs::remove_dir_all(tree.build()).unwrap();
            let parallel = compiler(8)
                .compile_files(&tree.src(), false, &tree.build(), &tree.props, &[])
                .unwrap();

            assert_eq!(objects(&serial), objects(&parallel));
            let mut sorted = objects(&parallel);
            sorted.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
            assert_eq!(objects(&parallel), sorted);
        }

        #[test]
        fn test_order_compares_whole_paths_as_strings() {
            let tree = Tree::new(&["sub/c.cpp", "sub.c"]);
            let files = compiler(2)
                .compile_files(&tree.src(), true, &tree.build(), &tree.props, &[])
                .unwrap();
            assert_eq!(
                objects(&files),
                vec![tree.build().join("sub.c.o"), tree.build().join("sub/c.cpp.o")]
            );
        }

        #[test]
        fn test_first_error_is_reported() {
            let tree = Tree::new(&["ok.cpp", "fail.cpp"]);
            let err = compiler(2)
                .compile_files(&tree.src(), false, &tree.build(), &tree.props, &[])
                .unwrap_err();
            assert!(format!("{:#}", err).contains("fail.cpp"));
            assert!(!is_cancellation(&err));
        }

        #[test]
        fn test_failure_kills_running_siblings() {
            let tree = Tree::new(&["late_fail.cpp", "slow.cpp"]);
            let started = std::time::Instant::now();
            let err = compiler(2)
                .compile_files(&tree.src(), false, &tree.build(), &tree.props, &[])
                .unwrap_err();
            assert!(started.elapsed() < std::time::Duration::from_secs(10));
            assert!(format!("{:#}", err).contains("late_fail.cpp"));
            assert!(!is_cancellation(&err));

            // The `sleep` started by the slow compile must not outlive it.
            let pid = fs::read_to_string(tree.dir.path().join("slow.pid")).unwrap();
            let pid = pid.trim();
            let mut tries = 0;
            while is_running(pid) && tries < 100 {
                std::thread::sleep(std::time::Duration::from_millis(20));
                tries += 1;
            }
            assert!(!is_running(pid), "grandchild {} still running", pid);
        }

        /// Zombies count as gone: an orphan may wait on a non-reaping init.
        fn is_running(pid: &str) -> bool {
            if Path::new("/proc/self").exists() {
                return fs::read_to_string(format!("/proc/{}/stat", pid))
                    .ok()
                    .and_then(|stat| {
                        let state = stat.rsplit(')').next()?.split_whitespace().next()?;
                        Some(state != "Z")
                    })
                    .unwrap_or(false);
            }
            std::process::Command::new("kill")
                .args(["-0", pid])
                .stderr(std::process::Stdio::null())
                .status()
                .is_ok_and(|s| s.success())
        }

        #[test]
        fn test_compile_with_explicit_recipe() {
            let tree = Tree::new(&["a.cpp", "b.c"]);
            let files = compiler(0)
                .compile_files_with_recipe(
                    &tree.src(),
                    false,
                    &tree.build(),
                    &tree.props,
                    &[PathBuf::from("/inc")],
                    "c",
                    "recipe.c.o.pattern",
                )
                .unwrap();
            assert_eq!(objects(&files), vec![tree.build().join("b.c.o")]);
            assert_eq!(files[0].command.args.last().map(String::as_str), Some("-I/inc"));
        }

        #[test]
        fn test_cancelled_build_compiles_nothing() {
            let tree = Tree::new(&["a.cpp", "b.cpp"]);
            let cancel = CancelToken::new();
            cancel.cancel();
            let c = Compiler::new(2, "default", ExecContext::new(false, cancel), false);
            let err = c
                .compile_files(&tree.src(), false, &tree.build(), &tree.props, &[])
                .unwrap_err();
            assert!(is_cancellation(&err));
            assert_eq!(tree.log_lines(), 0);
        }
    }
}
