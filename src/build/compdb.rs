//! `compile_commands.json` for editors and language servers.
//!
//! Every compiled or reused source is listed, so the file stays complete on
//! incremental builds.

use super::compiler::CompiledFile;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationCommand {
    pub directory: String,
    pub arguments: Vec<String>,
    pub file: String,
}

#[derive(Debug, Default)]
pub struct CompilationDatabase {
    file: PathBuf,
    contents: Vec<CompilationCommand>,
}

impl CompilationDatabase {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            contents: Vec::new(),
        }
    }

    pub fn load(file: &Path) -> Result<Self> {
        let data = fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let contents = serde_json::from_str(&data)
            .with_context(|| format!("Invalid compilation database {}", file.display()))?;
        Ok(Self {
            file: file.to_path_buf(),
            contents,
        })
    }

    pub fn add(&mut self, compiled: &CompiledFile) {
        let directory = match &compiled.command.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        self.contents.push(CompilationCommand {
            directory: directory.to_string_lossy().into_owned(),
            arguments: compiled.command.argv(),
            file: compiled.source.to_string_lossy().into_owned(),
        });
    }

    pub fn extend<'a>(&mut self, files: impl IntoIterator<Item = &'a CompiledFile>) {
        for file in files {
            self.add(file);
        }
    }

    pub fn entries(&self) -> &[CompilationCommand] {
        &self.contents
    }

    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.contents)?;
        fs::write(&self.file, json)
            .with_context(|| format!("Failed to write {}", self.file.display()))
    }
}
