//! Advisory project context.
//!
//! A handful of markdown documents under `.foreman/context/` (tech stack,
//! constraints, conventions) describe the project. They are opaque text to
//! the planner and the prompt builder; a missing directory just means no
//! context.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::rules;

/// One context document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDocument {
    /// File stem, e.g. `tech_stack`.
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    documents: Vec<ContextDocument>,
}

impl ProjectContext {
    pub fn new(documents: Vec<ContextDocument>) -> Self {
        Self { documents }
    }

    /// Read every `*.md` file in `dir`, sorted by name. Absent directory
    /// yields an empty context.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            debug!(dir = %dir.display(), "no project context directory");
            return Ok(Self::default());
        }

        let mut paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read context directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read context file {}", path.display()))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            documents.push(ContextDocument { name, content });
        }
        debug!(count = documents.len(), "loaded project context");
        Ok(Self { documents })
    }

    pub fn documents(&self) -> &[ContextDocument] {
        &self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.documents.iter().all(|d| d.content.trim().is_empty())
    }

    pub fn advertises_test_framework(&self) -> bool {
        self.documents
            .iter()
            .any(|d| rules::advertises_test_framework(&d.content))
    }

    /// Context rendered for inclusion in a worker's task text. Empty when
    /// there is no context.
    pub fn prompt_section(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut section = String::from("## Project Context\n");
        for doc in &self.documents {
            let content = doc.content.trim();
            if content.is_empty() {
                continue;
            }
            section.push_str(&format!("\n### {}\n\n{}\n", doc.name, content));
        }
        section
    }
}
