//! Decides whether a compiled object can be reused.
//!
//! Compilers run with `-MMD` emit a Makefile fragment next to each object:
//!
//! ```text
//! /build/sketch/Blink.ino.o: \
//!  /src/Blink/Blink.ino /src/Blink/pins\ map.h \
//!  /core/Arduino.h
//! ```
//!
//! Every ambiguous state resolves to [`Freshness::Stale`]: a needless rebuild
//! costs seconds, a stale object silently ends up in the firmware.

use crate::error::BuildError;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Every listed input is older than the object.
    UpToDate,
    /// The dependency file parsed to nothing; the object is trusted as is.
    NothingToCheck,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_up_to_date(&self) -> bool {
        !matches!(self, Freshness::Stale(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoObjectPath,
    NoDependencyPath,
    MissingObject,
    MissingDependencyFile,
    SourceNewerThanObject,
    SourceNewerThanDependencyFile,
    UnreadableDependencyFile,
    /// First row is not `<object>:`.
    ForeignTarget(String),
    MissingHeader(PathBuf),
    UnreadableHeader(PathBuf),
    HeaderNewer(PathBuf),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NoObjectPath => write!(f, "no object path"),
            StaleReason::NoDependencyPath => write!(f, "no dependency file path"),
            StaleReason::MissingObject => write!(f, "object file missing"),
            StaleReason::MissingDependencyFile => write!(f, "dependency file missing"),
            StaleReason::SourceNewerThanObject => write!(f, "source newer than object"),
            StaleReason::SourceNewerThanDependencyFile => {
                write!(f, "source newer than dependency file")
            }
            StaleReason::UnreadableDependencyFile => write!(f, "dependency file unreadable"),
            StaleReason::ForeignTarget(row) => {
                write!(f, "dependency file describes another target ({})", row)
            }
            StaleReason::MissingHeader(p) => write!(f, "{} missing", p.display()),
            StaleReason::UnreadableHeader(p) => write!(f, "cannot stat {}", p.display()),
            StaleReason::HeaderNewer(p) => write!(f, "{} newer than object", p.display()),
        }
    }
}

/// Checks `object` against `source` and the headers listed in `dependency`.
///
/// Only a failure to stat the source itself, or an unexpected error on the
/// object or dependency file, is reported as `Err`.
pub fn check(
    source: &Path,
    object: Option<&Path>,
    dependency: Option<&Path>,
) -> Result<Freshness, BuildError> {
    let Some(object) = object else {
        return Ok(Freshness::Stale(StaleReason::NoObjectPath));
    };
    let Some(dependency) = dependency else {
        return Ok(Freshness::Stale(StaleReason::NoDependencyPath));
    };

    let source_mtime = mtime(source).map_err(|e| BuildError::io(source, e))?;

    let Some(object_mtime) = optional_mtime(object)? else {
        return Ok(Freshness::Stale(StaleReason::MissingObject));
    };
    let Some(dependency_mtime) = optional_mtime(dependency)? else {
        return Ok(Freshness::Stale(StaleReason::MissingDependencyFile));
    };

    if source_mtime > object_mtime {
        return Ok(Freshness::Stale(StaleReason::SourceNewerThanObject));
    }
    if source_mtime > dependency_mtime {
        return Ok(Freshness::Stale(StaleReason::SourceNewerThanDependencyFile));
    }

    let content = match fs::read(dependency) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return Ok(Freshness::Stale(StaleReason::UnreadableDependencyFile)),
    };
    let Some(rules) = parse_dependency_file(&content) else {
        return Ok(Freshness::NothingToCheck);
    };

    if rules.target != object.to_string_lossy() {
        return Ok(Freshness::Stale(StaleReason::ForeignTarget(rules.target)));
    }

    for prerequisite in rules.prerequisites {
        let path = PathBuf::from(prerequisite);
        match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) if t > object_mtime => {
                return Ok(Freshness::Stale(StaleReason::HeaderNewer(path)));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Freshness::Stale(StaleReason::MissingHeader(path)));
            }
            Err(_) => return Ok(Freshness::Stale(StaleReason::UnreadableHeader(path))),
        }
    }

    Ok(Freshness::UpToDate)
}

/// Boolean form of [`check`].
pub fn is_up_to_date(
    source: &Path,
    object: Option<&Path>,
    dependency: Option<&Path>,
) -> Result<bool, BuildError> {
    Ok(check(source, object, dependency)?.is_up_to_date())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRules {
    /// First row without its trailing colon.
    pub target: String,
    pub prerequisites: Vec<String>,
}

/// Parses a `-MMD` dependency file. `None` when nothing but blank lines
/// remain after unescaping.
///
/// A first row that does not end with `:` is returned verbatim as the
/// target, so it never matches a real object path.
pub fn parse_dependency_file(content: &str) -> Option<DependencyRules> {
    let mut rows = content
        .lines()
        .map(|line| {
            let line = line.strip_suffix('\\').unwrap_or(line);
            line.trim()
        })
        .filter(|line| !line.is_empty());

    let first = unescape(rows.next()?);
    let target = match first.strip_suffix(':') {
        Some(t) => t.to_string(),
        None => first,
    };

    let prerequisites = rows.flat_map(split_escaped).collect();
    Some(DependencyRules {
        target,
        prerequisites,
    })
}

fn unescape(row: &str) -> String {
    let mut out = String::with_capacity(row.len());
    let mut chars = row.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek().copied()) {
            ('\\', Some(next @ (' ' | '\t' | '#' | '\\'))) => {
                out.push(next);
                chars.next();
            }
            ('$', Some('$')) => {
                out.push('$');
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

/// Splits a row on unescaped whitespace, unescaping each path.
fn split_escaped(row: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut current = String::new();
    let mut chars = row.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek().copied()) {
            ('\\', Some(next @ (' ' | '\t' | '#' | '\\'))) => {
                current.push(next);
                chars.next();
            }
            ('$', Some('$')) => {
                current.push('$');
                chars.next();
            }
            (' ' | '\t', _) => {
                if !current.is_empty() {
                    paths.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        paths.push(current);
    }
    paths
}

fn mtime(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

fn optional_mtime(path: &Path) -> Result<Option<SystemTime>, BuildError> {
    match mtime(path) {
        Ok(t) => Ok(Some(t)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(path: &Path, secs_ago: u64) {
        if !path.exists() {
            fs::write(path, "").unwrap();
        }
        let t = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(t)
            .unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        header: PathBuf,
        object: PathBuf,
        depfile: PathBuf,
    }

    /// source and header 100s old, object and depfile 50s old.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let source = root.join("Blink.ino");
        let header = root.join("pins map.h");
        let object = root.join("Blink.ino.o");
        let depfile = root.join("Blink.ino.d");

        touch(&source, 100);
        touch(&header, 100);
        touch(&object, 50);
        fs::write(
            &depfile,
            format!(
                "{}: \\\n {} \\\n {}\n",
                object.display(),
                source.display(),
                header.display().to_string().replace(' ', "\\ ")
            ),
        )
        .unwrap();
        touch(&depfile, 50);

        Fixture {
            _dir: dir,
            source,
            header,
            object,
            depfile,
        }
    }

    fn run(f: &Fixture) -> Freshness {
        check(&f.source, Some(&f.object), Some(&f.depfile)).unwrap()
    }

    #[test]
    fn test_up_to_date() {
        let f = fixture();
        assert_eq!(run(&f), Freshness::UpToDate);
    }

    #[test]
    fn test_touching_source_makes_stale() {
        let f = fixture();
        touch(&f.source, 0);
        assert_eq!(run(&f), Freshness::Stale(StaleReason::SourceNewerThanObject));
    }

    #[test]
    fn test_touching_unrelated_file_keeps_fresh() {
        let f = fixture();
        let other = f.source.with_file_name("unrelated.h");
        touch(&other, 0);
        assert_eq!(run(&f), Freshness::UpToDate);
    }

    #[test]
    fn test_header_newer_than_object() {
        let f = fixture();
        touch(&f.header, 0);
        assert_eq!(
            run(&f),
            Freshness::Stale(StaleReason::HeaderNewer(f.header.clone()))
        );
    }

    #[test]
    fn test_missing_header_is_stale() {
        let f = fixture();
        fs::remove_file(&f.header).unwrap();
        assert!(matches!(run(&f), Freshness::Stale(StaleReason::MissingHeader(_))));
    }

    #[test]
    fn test_missing_object_or_depfile() {
        let f = fixture();
        assert_eq!(
            check(&f.source, None, Some(&f.depfile)).unwrap(),
            Freshness::Stale(StaleReason::NoObjectPath)
        );
        assert_eq!(
            check(&f.source, Some(&f.object), None).unwrap(),
            Freshness::Stale(StaleReason::NoDependencyPath)
        );

        fs::remove_file(&f.depfile).unwrap();
        assert_eq!(run(&f), Freshness::Stale(StaleReason::MissingDependencyFile));
        fs::remove_file(&f.object).unwrap();
        assert_eq!(run(&f), Freshness::Stale(StaleReason::MissingObject));
    }

    #[test]
    fn test_missing_source_is_error() {
        let f = fixture();
        fs::remove_file(&f.source).unwrap();
        assert!(matches!(
            check(&f.source, Some(&f.object), Some(&f.depfile)),
            Err(BuildError::Io { .. })
        ));
    }

    #[test]
    fn test_depfile_older_than_source() {
        let f = fixture();
        touch(&f.depfile, 200);
        assert_eq!(
            run(&f),
            Freshness::Stale(StaleReason::SourceNewerThanDependencyFile)
        );
    }

    #[test]
    fn test_empty_depfile_is_trusted() {
        let f = fixture();
        fs::write(&f.depfile, "\n  \n\\\n").unwrap();
        touch(&f.depfile, 50);
        assert_eq!(run(&f), Freshness::NothingToCheck);
        assert!(run(&f).is_up_to_date());
    }

    #[test]
    fn test_foreign_or_malformed_target() {
        let f = fixture();
        fs::write(&f.depfile, "/elsewhere/other.o:\n").unwrap();
        touch(&f.depfile, 50);
        assert!(matches!(run(&f), Freshness::Stale(StaleReason::ForeignTarget(_))));

        let one_line = format!("{}: {}\n", f.object.display(), f.source.display());
        fs::write(&f.depfile, one_line).unwrap();
        touch(&f.depfile, 50);
        assert!(!run(&f).is_up_to_date());
    }

    #[test]
    fn test_parse_unescapes_paths() {
        let rules = parse_dependency_file(
            "out/a\\ b.o: \\\n src/a\\ b.c inc/\\#x.h \\\n inc/cost$$.h C:\\tools\\x.h\n",
        )
        .unwrap();
        assert_eq!(rules.target, "out/a b.o");
        assert_eq!(
            rules.prerequisites,
            vec!["src/a b.c", "inc/#x.h", "inc/cost$.h", "C:\\tools\\x.h"]
        );
    }

    #[test]
    fn test_parse_blank_file() {
        assert_eq!(parse_dependency_file(""), None);
        assert_eq!(parse_dependency_file(" \n\n"), None);
    }
}
