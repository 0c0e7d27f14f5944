//! Tests for the `skf` command line.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn skf(args: &[&str], dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_skf"))
        .args(args)
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute skf")
}

fn create_project(dir: &Path) {
    fs::create_dir_all(dir.join("hardware/cores/arduino")).unwrap();
    fs::create_dir_all(dir.join("Blink")).unwrap();
    fs::write(
        dir.join("hardware/platform.txt"),
        "name=Test AVR\nbuild.mcu=atmega328p\ncompiler.cpp.cmd=avr-g++\nrecipe.cpp.o.pattern={compiler.cpp.cmd} -mmcu={build.mcu}\n",
    )
    .unwrap();
    fs::write(
        dir.join("sketchforge.toml"),
        r#"
[board]
fqbn = "arduino:avr:uno"
properties = ["hardware/platform.txt"]

[paths]
sketch = "Blink"
cache = "my-cache"
core = "hardware/cores/arduino"
"#,
    )
    .unwrap();
}

#[test]
fn test_missing_config_shows_tip() {
    let dir = tempfile::tempdir().unwrap();
    let output = skf(&["build"], dir.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sketchforge.toml not found"), "{}", stderr);
    assert!(stderr.contains("Tip"), "{}", stderr);
}

#[test]
fn test_show_properties_filters_and_expands() {
    let dir = tempfile::tempdir().unwrap();
    create_project(dir.path());

    let output = skf(&["show-properties", "recipe.", "--expand"], dir.path());
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("recipe.cpp.o.pattern"), "{}", stdout);
    assert!(stdout.contains("avr-g++ -mmcu=atmega328p"), "{}", stdout);
    assert!(!stdout.contains("build.mcu"), "{}", stdout);
}

#[test]
fn test_cache_path_uses_project_override() {
    let dir = tempfile::tempdir().unwrap();
    create_project(dir.path());

    let output = skf(&["cache", "path"], dir.path());
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.trim().ends_with("my-cache"), "{}", stdout);
}

#[test]
fn test_completion_script() {
    let dir = tempfile::tempdir().unwrap();
    let output = skf(&["completion", "bash"], dir.path());
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("skf"));
}

#[test]
fn test_invalid_warning_level_rejected() {
    let dir = tempfile::tempdir().unwrap();
    create_project(dir.path());
    let output = skf(&["build", "--warnings", "loud"], dir.path());
    assert!(!output.status.success());
}
