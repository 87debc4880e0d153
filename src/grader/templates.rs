//! Rubric prompt templates.
//!
//! Each rubric has a `<rubric>.txt` template in the prompts directory with
//! `{{prompt}}`, `{{response}}`, `{{expected}}` and `{{expected_tool}}`
//! placeholders (`{{rubric}}` is also available). Templates are loaded once
//! at startup; a missing template is a configuration error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::GraderError;

/// A loaded template and the digest of its text.
#[derive(Debug, Clone, PartialEq)]
pub struct RubricTemplate {
    pub text: String,
    pub digest: String,
}

impl RubricTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Self { text, digest }
    }

    /// Substitutes the grading inputs into the template.
    pub fn render(&self, rubric: &str, prompt: &str, response: &str, expected: &str) -> String {
        self.text
            .replace("{{rubric}}", rubric)
            .replace("{{prompt}}", prompt)
            .replace("{{response}}", response)
            .replace("{{expected_tool}}", expected)
            .replace("{{expected}}", expected)
    }
}

/// Templates keyed by rubric name.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, RubricTemplate>,
}

impl TemplateStore {
    /// Loads `<dir>/<rubric>.txt` for every rubric.
    ///
    /// # Errors
    ///
    /// Returns `GraderError::TemplateMissing` for the first rubric without a
    /// template file.
    pub fn load<'a>(
        dir: &Path,
        rubrics: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, GraderError> {
        let mut templates = HashMap::new();
        for rubric in rubrics {
            let path = dir.join(format!("{rubric}.txt"));
            if !path.is_file() {
                return Err(GraderError::TemplateMissing {
                    rubric: rubric.to_string(),
                    path,
                });
            }
            let template = RubricTemplate::new(fs::read_to_string(&path)?);
            debug!(rubric, digest = %&template.digest[..12], "Loaded rubric template");
            templates.insert(rubric.to_string(), template);
        }
        Ok(Self { templates })
    }

    /// Builds a store from in-memory templates.
    pub fn from_templates<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            templates: entries
                .into_iter()
                .map(|(k, v)| (k.into(), RubricTemplate::new(v)))
                .collect(),
        }
    }

    pub fn get(&self, rubric: &str) -> Result<&RubricTemplate, GraderError> {
        self.templates
            .get(rubric)
            .ok_or_else(|| GraderError::UnknownRubric(rubric.to_string()))
    }

    pub fn contains(&self, rubric: &str) -> bool {
        self.templates.contains_key(rubric)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
