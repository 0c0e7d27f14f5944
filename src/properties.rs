//! Ordered property store with `{key}` template expansion.
//!
//! Platform and board definitions are flat `key=value` files with dotted,
//! hierarchical keys:
//!
//! ```text
//! uno.name=Arduino Uno
//! uno.build.mcu=atmega328p
//! recipe.c.o.pattern="{compiler.path}{compiler.c.cmd}" {compiler.c.flags} ...
//! ```
//!
//! Keys keep their insertion order so iteration (and anything serialized from
//! it) is deterministic. Recipes are ordinary values containing `{key}`
//! markers, resolved with [`PropertyStore::expand_props_in_string`].

use crate::error::BuildError;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// Maximum number of substitution passes; bounds self-referencing values.
const MAX_EXPANSION_PASSES: usize = 10;

static UNEXPANDED_PROP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{.+?\}").expect("static regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyStore {
    kv: HashMap<String, String>,
    order: Vec<String>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a properties file. `key.<os>` entries for the host OS lose
    /// their suffix, so they override the generic key when loaded later.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let bytes = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        let suffix = os_suffix()?;

        let mut store = Self::new();
        for (idx, line) in text.lines().enumerate() {
            store
                .parse_line(line, suffix)
                .map_err(|reason| BuildError::PropertyFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason,
                })?;
        }
        Ok(store)
    }

    /// Like [`PropertyStore::load`] but a missing file yields an empty store.
    pub fn safe_load(path: &Path) -> Result<Self, BuildError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::load(path)
    }

    pub fn load_from_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, BuildError> {
        let suffix = os_suffix()?;
        let mut store = Self::new();
        for (idx, line) in lines.iter().enumerate() {
            store
                .parse_line(line.as_ref(), suffix)
                .map_err(|reason| BuildError::PropertyFile {
                    path: "<inline>".into(),
                    line: idx + 1,
                    reason,
                })?;
        }
        Ok(store)
    }

    fn parse_line(&mut self, line: &str, os_suffix: &str) -> Result<(), String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| "invalid line format, should be 'key=value'".to_string())?;
        let key = key.trim().replacen(&format!(".{}", os_suffix), "", 1);
        self.set(key, value.trim());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.kv.contains_key(key)
    }

    /// Inserts or replaces `key`; a replaced key moves to the end of the
    /// iteration order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.kv.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push(key.clone());
        self.kv.insert(key, value.into());
    }

    pub fn set_path(&mut self, key: impl Into<String>, path: &Path) {
        self.set(key, path.to_string_lossy());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let value = self.kv.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(|k| (k.as_str(), self.kv[k].as_str()))
    }

    /// Copies every entry of `other` into `self`, later entries winning.
    pub fn merge(&mut self, other: &PropertyStore) -> &mut Self {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
        self
    }

    /// Keys under `prefix.`, with the prefix stripped.
    pub fn sub_tree(&self, prefix: &str) -> PropertyStore {
        let root = format!("{}.", prefix);
        let mut sub = PropertyStore::new();
        for (key, value) in self.iter() {
            if let Some(rest) = key.strip_prefix(&root) {
                sub.set(rest, value);
            }
        }
        sub
    }

    /// First segments of all keys, in order of first appearance.
    pub fn first_level_keys(&self) -> Vec<String> {
        let mut seen = Vec::<String>::new();
        for key in self.keys() {
            let first = key.split('.').next().unwrap_or(key);
            if !seen.iter().any(|s| s == first) {
                seen.push(first.to_string());
            }
        }
        seen
    }

    /// Groups dotted keys by their first segment. Keys without a dot are
    /// dropped.
    pub fn first_level_of(&self) -> Vec<(String, PropertyStore)> {
        let mut groups: Vec<(String, PropertyStore)> = Vec::new();
        for (key, value) in self.iter() {
            let Some((first, rest)) = key.split_once('.') else {
                continue;
            };
            match groups.iter_mut().find(|(name, _)| name == first) {
                Some((_, sub)) => sub.set(rest, value),
                None => {
                    let mut sub = PropertyStore::new();
                    sub.set(rest, value);
                    groups.push((first.to_string(), sub));
                }
            }
        }
        groups
    }

    /// Replaces `{key}` markers with their values, re-scanning up to ten
    /// times so values may reference other keys. Unknown markers are kept
    /// verbatim. A cyclic definition stops after the pass limit, partially
    /// expanded.
    pub fn expand_props_in_string(&self, template: &str) -> String {
        let mut current = template.to_string();
        for _ in 0..MAX_EXPANSION_PASSES {
            let next = self.expand_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn expand_once(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            // The marker name runs to the next '}' unless another '{' starts
            // first, in which case the inner marker is resolved first.
            match after.find(['{', '}']) {
                Some(end) if after.as_bytes()[end] == b'}' => {
                    let name = &after[..end];
                    match self.kv.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Removes every `{...}` marker left over after expansion.
pub fn delete_unexpanded_props(s: &str) -> String {
    UNEXPANDED_PROP.replace_all(s, "").into_owned()
}

/// Splits a command line on spaces, keeping spans that start and end with
/// one of `quote_chars` together as a single argument (quotes removed).
/// Quotes inside a token are literal, so `-DNAME="x"` passes through as is.
pub fn split_quoted_string(
    src: &str,
    quote_chars: &str,
    accept_empty_arguments: bool,
) -> Result<Vec<String>, BuildError> {
    let mut result = Vec::new();
    let mut quote: Option<char> = None;
    let mut quoted_arg = String::new();

    for token in src.split(' ') {
        let mut current = token;
        if quote.is_none() {
            if current.is_empty() {
                continue;
            }
            let first = current.chars().next().unwrap_or_default();
            if !quote_chars.contains(first) {
                result.push(current.to_string());
                continue;
            }
            quote = Some(first);
            current = &current[first.len_utf8()..];
            quoted_arg.clear();
        }

        let q = quote.unwrap_or_default();
        match current.strip_suffix(q) {
            Some(head) => {
                quoted_arg.push_str(head);
                if !quoted_arg.is_empty() || accept_empty_arguments {
                    result.push(std::mem::take(&mut quoted_arg));
                }
                quote = None;
            }
            None => {
                quoted_arg.push_str(current);
                quoted_arg.push(' ');
            }
        }
    }

    match quote {
        Some(q) => Err(BuildError::InvalidQuoting { quote: q }),
        None => Ok(result),
    }
}

/// Suffix used by platform files for host-specific keys.
pub fn os_suffix() -> Result<&'static str, BuildError> {
    match std::env::consts::OS {
        "linux" => Ok("linux"),
        "windows" => Ok("windows"),
        "freebsd" => Ok("freebsd"),
        "macos" => Ok("macosx"),
        other => Err(BuildError::UnsupportedOs(other.to_string())),
    }
}
