//! Model description ("MUD") files.
//!
//! A MUD file is a small INI-style text file shipped next to the compiled
//! model partitions. It names the partition file template, the embedding
//! table, the post model and the tokenizer endpoint, plus the default
//! sampling configuration. Relative paths are resolved against the MUD
//! file's own directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{LlmError, Result};

/// Parsed MUD file: sections of key/value pairs plus the base directory
/// used to resolve relative model paths.
#[derive(Debug, Clone, Default)]
pub struct MudFile {
    base_dir: PathBuf,
    sections: HashMap<String, HashMap<String, String>>,
}

impl MudFile {
    /// Read and parse a MUD file from disk.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LlmError::load(format!("failed to read {}: {e}", path.display())))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse_str(&text, base_dir)
    }

    /// Parse MUD text with an explicit base directory.
    pub fn parse_str(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(LlmError::args(format!(
                    "mud line {} is neither a section nor key=value: {raw:?}",
                    lineno + 1
                )));
            };
            let Some(section) = current.as_ref() else {
                return Err(LlmError::args(format!(
                    "mud line {} has a key outside any [section]",
                    lineno + 1
                )));
            };
            sections
                .get_mut(section)
                .map(|s| s.insert(key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            base_dir: base_dir.into(),
            sections,
        })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn has(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    /// Fetch a required key; a miss is an argument error naming the key.
    pub fn require(&self, section: &str, key: &str) -> Result<&str> {
        self.get(section, key)
            .ok_or_else(|| LlmError::args(format!("mud file missing [{section}] {key}")))
    }

    pub fn require_usize(&self, section: &str, key: &str) -> Result<usize> {
        let raw = self.require(section, key)?;
        raw.parse()
            .map_err(|_| LlmError::args(format!("mud [{section}] {key} is not an integer: {raw:?}")))
    }

    pub fn require_f32(&self, section: &str, key: &str) -> Result<f32> {
        let raw = self.require(section, key)?;
        raw.parse()
            .map_err(|_| LlmError::args(format!("mud [{section}] {key} is not a number: {raw:?}")))
    }

    /// "true" or "1" mean true, anything else false.
    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => v == "true" || v == "1",
            None => default,
        }
    }

    pub fn require_bool(&self, section: &str, key: &str) -> Result<bool> {
        let raw = self.require(section, key)?;
        Ok(raw == "true" || raw == "1")
    }

    /// Resolve a model path from the MUD against the file's directory.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let p = Path::new(relative);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
