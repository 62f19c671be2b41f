//! Escalations: human-review requests raised when automation cannot safely continue.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// What an escalation asks a human to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub workflow_id: String,
    pub step: u32,
    pub question: String,
    pub reasoning: String,
    pub confidence: f64,
    pub context: BTreeMap<String, String>,
}

/// Receives escalations and returns an id for later reference.
pub trait EscalationSink {
    fn raise(&self, escalation: &Escalation) -> Result<String>;
}

/// A stored escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub raised_at: DateTime<Utc>,
    #[serde(flatten)]
    pub escalation: Escalation,
}

/// Writes one JSON file per escalation into a directory.
#[derive(Debug, Clone)]
pub struct FileEscalationSink {
    dir: PathBuf,
}

impl FileEscalationSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Escalations raised for `workflow_id`, oldest first.
    pub fn list_for(&self, workflow_id: &str) -> Result<Vec<EscalationRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read escalation {}", path.display()))?;
            let record: EscalationRecord = serde_json::from_str(&contents)
                .with_context(|| format!("parse escalation {}", path.display()))?;
            if record.escalation.workflow_id == workflow_id {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

impl EscalationSink for FileEscalationSink {
    #[instrument(skip_all, fields(workflow_id = %escalation.workflow_id, step = escalation.step))]
    fn raise(&self, escalation: &Escalation) -> Result<String> {
        let raised_at = Utc::now();
        let suffix = rand::thread_rng().gen_range(0..=u16::MAX);
        let id = format!(
            "esc-{}-{suffix:04x}",
            raised_at.format("%Y%m%dT%H%M%S%3f")
        );
        let record = EscalationRecord {
            id: id.clone(),
            raised_at,
            escalation: escalation.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&record).context("serialize escalation")?;
        buf.push('\n');
        let path = self.dir.join(format!("{id}.json"));
        super::write_atomic(&path, &buf)?;
        info!(escalation_id = %id, confidence = escalation.confidence, "escalation raised");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escalation(workflow_id: &str, step: u32) -> Escalation {
        Escalation {
            workflow_id: workflow_id.to_string(),
            step,
            question: "Gate 'review' blocked".to_string(),
            reasoning: "score 70.0 below 85.0".to_string(),
            confidence: 0.7,
            context: BTreeMap::from([("gate".to_string(), "review".to_string())]),
        }
    }

    #[test]
    fn raise_persists_and_lists_by_workflow() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = FileEscalationSink::new(temp.path().join("escalations"));
        let first = sink.raise(&escalation("wf-a", 3)).expect("raise");
        let second = sink.raise(&escalation("wf-b", 1)).expect("raise");
        assert_ne!(first, second);

        let records = sink.list_for("wf-a").expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, first);
        assert_eq!(records[0].escalation, escalation("wf-a", 3));
    }

    #[test]
    fn list_without_directory_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = FileEscalationSink::new(temp.path().join("none"));
        assert!(sink.list_for("wf").expect("list").is_empty());
    }
}
