//! YAML storage for stack manifests
//!
//! Stacks are declared in `.stackctl/stacks/{name}.yaml`, one stack per file.
//! The file stem must match the stack's `name`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::domain::{Stack, StackName};

/// Store for stack declarations
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates the default store for a project
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".stackctl").join("stacks"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, name: &StackName) -> PathBuf {
        self.dir.join(format!("{}.yaml", name))
    }

    fn read_from_file(&self, path: &Path) -> Result<Stack> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        let stack: Stack = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != stack.name.as_str() {
            bail!(
                "Manifest {} declares stack '{}'; the file must be named {}.yaml",
                path.display(),
                stack.name,
                stack.name
            );
        }

        stack
            .validate()
            .with_context(|| format!("Invalid manifest: {}", path.display()))?;

        Ok(stack)
    }

    /// Names of all declared stacks, alphabetically
    pub fn list(&self) -> Result<Vec<StackName>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read directory: {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            let name = StackName::new(stem)
                .with_context(|| format!("Invalid manifest file name: {}", path.display()))?;
            names.push(name);
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Reads every stack in declaration order
    ///
    /// Stacks named in `order` come first, in that order; the rest follow
    /// alphabetically.
    pub fn read_all(&self, order: &[StackName]) -> Result<Vec<Stack>> {
        let available = self.list()?;
        let available_set: HashSet<_> = available.iter().collect();

        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(available.len());

        for name in order {
            if !available_set.contains(name) {
                bail!("Stack '{}' is listed in config.toml but has no manifest", name);
            }
            if seen.insert(name) {
                names.push(name.clone());
            }
        }
        for name in &available {
            if seen.insert(name) {
                names.push(name.clone());
            }
        }

        names
            .iter()
            .map(|name| self.read_path(name))
            .collect()
    }

    fn read_path(&self, name: &StackName) -> Result<Stack> {
        let yaml = self.manifest_path(name);
        if yaml.exists() {
            return self.read_from_file(&yaml);
        }
        self.read_from_file(&self.dir.join(format!("{}.yml", name)))
    }

    /// Reads one stack by name
    pub fn read(&self, name: &StackName) -> Result<Option<Stack>> {
        if !self.exists(name) {
            return Ok(None);
        }
        self.read_path(name).map(Some)
    }

    /// Writes a stack manifest
    pub fn write(&self, stack: &Stack) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;

        let content = serde_yaml::to_string(stack).context("Failed to serialize manifest")?;
        let path = self.manifest_path(&stack.name);
        let temp_path = path.with_extension("yaml.tmp");

        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write manifest: {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename manifest: {}", path.display()))
    }

    pub fn exists(&self, name: &StackName) -> bool {
        self.manifest_path(name).exists() || self.dir.join(format!("{}.yml", name)).exists()
    }
}
