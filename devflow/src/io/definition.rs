//! Loading workflow definitions and deriving their identity.

use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};

use crate::core::markup::parse_definition;
use crate::core::step::WorkflowDefinition;
pub use crate::core::types::validate_id;
use crate::error::FlowError;

/// A parsed definition plus the fingerprint of the source it came from.
#[derive(Debug, Clone)]
pub struct LoadedDefinition {
    pub definition: WorkflowDefinition,
    /// Lowercase hex SHA-256 of the source text.
    pub digest: String,
}

/// Read and parse a definition file. The file stem names workflows that
/// carry no `<workflow name>` wrapper.
pub fn load_definition(path: &Path) -> Result<LoadedDefinition, FlowError> {
    let source = fs::read_to_string(path).map_err(|err| {
        FlowError::store(format!("read definition {}", path.display()), &anyhow!(err))
    })?;
    parse_source(&source, &file_stem(path))
}

pub fn parse_source(source: &str, fallback_name: &str) -> Result<LoadedDefinition, FlowError> {
    let definition = parse_definition(source, fallback_name)?;
    Ok(LoadedDefinition {
        definition,
        digest: digest(source),
    })
}

pub fn digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string())
}

/// Workflow id for a sub-workflow invoked from `step` of `parent_id`.
pub fn child_workflow_id(parent_id: &str, step: u32, path: &str) -> String {
    let stem: String = file_stem(Path::new(path))
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{parent_id}.step{step}.{stem}")
}
