//! Recipe expansion and execution.
//!
//! A recipe is a property whose value is a command-line template. It is
//! expanded against a (usually specialised) [`PropertyStore`], split into an
//! argv with [`split_quoted_string`] and spawned directly, without a shell.

use super::cancel::CancelToken;
use crate::error::BuildError;
use crate::keys;
use crate::properties::{PropertyStore, delete_unexpanded_props, split_quoted_string};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Command lines longer than this are shortened before spawning.
pub const MAX_COMMAND_LINE_LENGTH: usize = 30000;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Ignore,
    Show,
    ShowIfVerbose,
    Capture,
}

impl OutputMode {
    fn stdio(self, verbose: bool) -> Stdio {
        match self {
            OutputMode::Ignore => Stdio::null(),
            OutputMode::Show => Stdio::inherit(),
            OutputMode::ShowIfVerbose if verbose => Stdio::inherit(),
            OutputMode::ShowIfVerbose => Stdio::null(),
            OutputMode::Capture => Stdio::piped(),
        }
    }
}

/// Execution settings shared by every recipe of one build.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub verbose: bool,
    pub cancel: CancelToken,
}

impl ExecContext {
    pub fn new(verbose: bool, cancel: CancelToken) -> Self {
        Self { verbose, cancel }
    }

    /// Same settings, observing `cancel` instead.
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            verbose: self.verbose,
            cancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Set when arguments were made relative to `build.path`.
    pub working_dir: Option<PathBuf>,
}

impl PreparedCommand {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn command_line_len(&self) -> usize {
        self.program.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>()
    }

    /// Shell-like rendering for logs and the compilation database.
    pub fn printable(&self) -> String {
        self.argv()
            .iter()
            .map(|a| printable_argument(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn needs_response_file(&self) -> bool {
        self.command_line_len() > MAX_COMMAND_LINE_LENGTH
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Quotes an argument containing spaces, tabs, quotes or backslashes.
pub fn printable_argument(arg: &str) -> String {
    if arg.contains(['"', '\\', ' ', '\t']) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Expands `recipe` into an argv. With `remove_unset`, markers that could
/// not be expanded are dropped instead of reaching the tool verbatim.
///
/// When the expanded line exceeds [`MAX_COMMAND_LINE_LENGTH`], existing
/// files under `build.path` are rewritten relative to it and the command is
/// set to run from there.
pub fn prepare_command_for_recipe(
    props: &PropertyStore,
    recipe: &str,
    remove_unset: bool,
) -> Result<PreparedCommand, BuildError> {
    let pattern = props.get(recipe).unwrap_or_default();
    if pattern.is_empty() {
        return Err(BuildError::PatternMissing {
            recipe: recipe.to_string(),
        });
    }

    let mut command_line = props.expand_props_in_string(pattern);
    if remove_unset {
        command_line = delete_unexpanded_props(&command_line);
    }

    let mut parts = split_quoted_string(&command_line, "\"'", false)?;
    if parts.is_empty() {
        return Err(BuildError::PatternMissing {
            recipe: recipe.to_string(),
        });
    }

    let mut working_dir = None;
    if command_line.len() > MAX_COMMAND_LINE_LENGTH {
        if let Some(build_path) = props.get(keys::BUILD_PATH).filter(|p| !p.is_empty()) {
            let build_path = Path::new(build_path);
            for arg in parts.iter_mut().skip(1) {
                if let Some(rel) = relative_to(build_path, arg) {
                    *arg = rel;
                }
            }
            working_dir = Some(build_path.to_path_buf());
        }
    }

    let program = parts.remove(0);
    Ok(PreparedCommand {
        program,
        args: parts,
        working_dir,
    })
}

fn relative_to(base: &Path, arg: &str) -> Option<String> {
    let path = Path::new(arg);
    if !path.exists() {
        return None;
    }
    let rel = path.strip_prefix(base).ok()?.to_string_lossy().into_owned();
    (!rel.is_empty() && rel.len() < arg.len()).then_some(rel)
}

/// Expands and runs `recipe`. A non-zero exit is reported as
/// [`BuildError::CommandFailed`] carrying whatever stderr was captured.
pub fn exec_recipe(
    props: &PropertyStore,
    recipe: &str,
    remove_unset: bool,
    stdout: OutputMode,
    stderr: OutputMode,
    ctx: &ExecContext,
) -> Result<ExecOutput, BuildError> {
    let command = prepare_command_for_recipe(props, recipe, remove_unset)?;
    exec_command(&command, recipe, stdout, stderr, ctx)
}

/// Runs an already prepared command, polling `ctx.cancel` while it runs.
pub fn exec_command(
    command: &PreparedCommand,
    recipe: &str,
    stdout: OutputMode,
    stderr: OutputMode,
    ctx: &ExecContext,
) -> Result<ExecOutput, BuildError> {
    ctx.cancel.check()?;
    if ctx.verbose {
        println!("{}", command.printable());
    }
    tracing::debug!(recipe, command = %command.printable(), "exec");

    let mut cmd = Command::new(&command.program);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    // Held until the child exits; removed on drop.
    let _response_file = if command.needs_response_file() {
        let dir = command
            .working_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let file = write_response_file(&dir, &command.args)?;
        tracing::debug!(recipe, path = %file.path().display(), "using response file");
        cmd.arg(format!("@{}", file.path().display()));
        Some(file)
    } else {
        cmd.args(&command.args);
        None
    };

    cmd.stdin(Stdio::null())
        .stdout(stdout.stdio(ctx.verbose))
        .stderr(stderr.stdio(ctx.verbose));
    own_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| BuildError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdout_reader = child.stdout.take().map(drain);
    let stderr_reader = child.stderr.take().map(drain);

    let status = wait_cancellable(&mut child, &command.program, &ctx.cancel)?;

    let output = ExecOutput {
        stdout: join(stdout_reader),
        stderr: join(stderr_reader),
    };

    if !status.success() {
        return Err(BuildError::CommandFailed {
            recipe: recipe.to_string(),
            status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

fn write_response_file(
    dir: &Path,
    args: &[String],
) -> Result<tempfile::NamedTempFile, BuildError> {
    let mut file = tempfile::Builder::new()
        .prefix("args-")
        .suffix(".rsp")
        .tempfile_in(dir)
        .map_err(|e| BuildError::io(dir, e))?;
    let body = args
        .iter()
        .map(|a| printable_argument(a))
        .collect::<Vec<_>>()
        .join("\n");
    file.write_all(body.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| BuildError::io(file.path(), e))?;
    Ok(file)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn wait_cancellable(
    child: &mut Child,
    program: &str,
    cancel: &CancelToken,
) -> Result<ExitStatus, BuildError> {
    loop {
        if let Err(e) = cancel.check() {
            // Pipe readers are left detached.
            kill_process_tree(child);
            tracing::debug!(program, "killed on cancellation");
            return Err(e);
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill_process_tree(child);
                return Err(BuildError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
        }
    }
}

/// Puts the child at the head of a new process group so a cancellation
/// also reaches the tools it starts (`cc1plus`, `as`, a wrapping `sh`).
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal. The group id is the pid of
            // a child we have not reaped yet, so it cannot have been reused.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropertyStore {
        let mut p = PropertyStore::new();
        for (k, v) in pairs {
            p.set(*k, *v);
        }
        p
    }

    #[test]
    fn test_missing_pattern() {
        let p = props(&[("recipe.c.o.pattern", "")]);
        for recipe in ["recipe.c.o.pattern", "recipe.cpp.o.pattern"] {
            let err = prepare_command_for_recipe(&p, recipe, false).unwrap_err();
            assert!(matches!(err, BuildError::PatternMissing { .. }));
        }
    }

    #[test]
    fn test_prepare_expands_and_splits() {
        let p = props(&[
            ("compiler.path", "/opt/my tools/"),
            (
                "recipe.c.o.pattern",
                "\"{compiler.path}gcc\" -c {extra} \"{source_file}\" -o \"{object_file}\"",
            ),
            ("source_file", "/src/a b.c"),
            ("object_file", "/build/a b.c.o"),
        ]);

        let cmd = prepare_command_for_recipe(&p, "recipe.c.o.pattern", true).unwrap();
        assert_eq!(cmd.program, "/opt/my tools/gcc");
        assert_eq!(cmd.args, vec!["-c", "/src/a b.c", "-o", "/build/a b.c.o"]);
        assert_eq!(cmd.working_dir, None);

        let kept = prepare_command_for_recipe(&p, "recipe.c.o.pattern", false).unwrap();
        assert!(kept.args.contains(&"{extra}".to_string()));
    }

    #[test]
    fn test_prepare_reports_bad_quoting() {
        let p = props(&[("recipe.ar.pattern", "ar rcs \"core.a")]);
        let err = prepare_command_for_recipe(&p, "recipe.ar.pattern", false).unwrap_err();
        assert!(matches!(err, BuildError::InvalidQuoting { quote: '"' }));
    }

    #[test]
    fn test_printable_argument() {
        assert_eq!(printable_argument("-Os"), "-Os");
        assert_eq!(printable_argument("a b"), "\"a b\"");
        assert_eq!(printable_argument("-DX=\"1\""), "\"-DX=\\\"1\\\"\"");
        assert_eq!(printable_argument("C:\\x"), "\"C:\\\\x\"");
    }

    #[test]
    fn test_long_command_line_is_relativised() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path();
        let object = build.join("sketch").join("Blink.ino.o");
        std::fs::create_dir_all(object.parent().unwrap()).unwrap();
        std::fs::write(&object, "").unwrap();

        let padding = "-DPAD ".repeat(MAX_COMMAND_LINE_LENGTH / 6 + 1);
        let build_str = build.to_string_lossy().to_string();
        let object_str = object.to_string_lossy().to_string();
        let p = props(&[
            ("build.path", build_str.as_str()),
            ("object_file", object_str.as_str()),
            ("pad", padding.as_str()),
            ("recipe.c.combine.pattern", "gcc {pad} \"{object_file}\" /no/such/file"),
        ]);

        let cmd = prepare_command_for_recipe(&p, "recipe.c.combine.pattern", false).unwrap();
        assert_eq!(cmd.working_dir.as_deref(), Some(build));
        assert!(cmd.args.contains(&format!("sketch{}Blink.ino.o", std::path::MAIN_SEPARATOR)));
        assert!(cmd.args.contains(&"/no/such/file".to_string()));
        assert!(cmd.needs_response_file());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        #[test]
        fn test_exec_captures_output() {
            let p = props(&[("recipe.size.pattern", "sh -c 'echo text; echo warn >&2'")]);
            let out = exec_recipe(
                &p,
                "recipe.size.pattern",
                false,
                OutputMode::Capture,
                OutputMode::Capture,
                &ExecContext::default(),
            )
            .unwrap();
            assert_eq!(String::from_utf8_lossy(&out.stdout), "text\n");
            assert_eq!(String::from_utf8_lossy(&out.stderr), "warn\n");
        }

        #[test]
        fn test_exec_failure_carries_stderr() {
            let p = props(&[("recipe.c.o.pattern", "sh -c 'echo broken >&2; exit 3'")]);
            let err = exec_recipe(
                &p,
                "recipe.c.o.pattern",
                false,
                OutputMode::Ignore,
                OutputMode::Capture,
                &ExecContext::default(),
            )
            .unwrap_err();
            match err {
                BuildError::CommandFailed { recipe, status, stderr } => {
                    assert_eq!(recipe, "recipe.c.o.pattern");
                    assert_eq!(status.code(), Some(3));
                    assert_eq!(stderr.trim(), "broken");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_spawn_failure() {
            let p = props(&[("recipe.ar.pattern", "/definitely/not/a/tool rcs x.a")]);
            let err = exec_recipe(
                &p,
                "recipe.ar.pattern",
                false,
                OutputMode::Ignore,
                OutputMode::Ignore,
                &ExecContext::default(),
            )
            .unwrap_err();
            assert!(matches!(err, BuildError::Spawn { .. }));
        }

        #[test]
        fn test_cancel_kills_running_child() {
            let p = props(&[("recipe.c.o.pattern", "sleep 5")]);
            let cancel = CancelToken::new();
            let ctx = ExecContext::new(false, cancel.clone());
            let trigger = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                trigger.cancel();
            });

            let start = Instant::now();
            let err = exec_recipe(
                &p,
                "recipe.c.o.pattern",
                false,
                OutputMode::Ignore,
                OutputMode::Ignore,
                &ctx,
            )
            .unwrap_err();
            assert!(matches!(err, BuildError::Cancelled));
            assert!(start.elapsed() < Duration::from_secs(3));
        }

        #[test]
        fn test_timeout_kills_running_child() {
            let p = props(&[("recipe.c.o.pattern", "sleep 5")]);
            let cancel = CancelToken::with_timeout(Duration::from_millis(100));
            let ctx = ExecContext::new(false, cancel);
            let err = exec_recipe(
                &p,
                "recipe.c.o.pattern",
                false,
                OutputMode::Ignore,
                OutputMode::Ignore,
                &ctx,
            )
            .unwrap_err();
            assert!(matches!(err, BuildError::TimedOut));
        }

        #[test]
        fn test_overlong_command_uses_response_file() {
            let dir = tempfile::tempdir().unwrap();
            let tool = dir.path().join("tool.sh");
            let seen = dir.path().join("seen.txt");
            std::fs::write(
                &tool,
                format!(
                    "#!/bin/sh\ncase \"$1\" in @*) cp \"${{1#@}}\" '{}' ;; *) exit 9 ;; esac\n",
                    seen.display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

            let padding = "-DPAD ".repeat(MAX_COMMAND_LINE_LENGTH / 6 + 1);
            let tool_str = tool.to_string_lossy().to_string();
            let p = props(&[
                ("tool", tool_str.as_str()),
                ("pad", padding.as_str()),
                ("recipe.c.combine.pattern", "{tool} {pad} \"with space\""),
            ]);
            exec_recipe(
                &p,
                "recipe.c.combine.pattern",
                false,
                OutputMode::Ignore,
                OutputMode::Capture,
                &ExecContext::default(),
            )
            .unwrap();

            let body = std::fs::read_to_string(&seen).unwrap();
            assert!(body.starts_with("-DPAD\n-DPAD"));
            assert!(body.ends_with("\"with space\""));
        }
    }
}
