//! Run summaries and their text rendering.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{CoverageVector, Method};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationLevel {
    pub path: String,
    pub method: Method,
    pub level: u8,
}

/// Outcome of one fuzzing iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationReport {
    pub iteration: u64,
    pub nodes: usize,
    pub coverage: CoverageVector,
    pub improved: bool,
    /// Server errors (5xx other than 599) seen in this iteration.
    pub crashes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzSummary {
    pub title: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub seed: u64,
    pub guided: bool,
    pub strict: bool,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub iterations: u64,
    pub improvements: u64,
    #[serde(rename = "corpusSize")]
    pub corpus_size: usize,
    pub crashes: u64,
    #[serde(rename = "crashSignatures")]
    pub crash_signatures: usize,
    pub coverage: CoverageVector,
    pub operations: Vec<OperationLevel>,
    #[serde(rename = "workspace")]
    pub workspace_dir: String,
}

impl FuzzSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "title={} runId={} seed={} guided={} strict={}\n",
            self.title, self.run_id, self.seed, self.guided, self.strict
        ));
        out.push_str(&format!(
            "iterations={} improvements={} corpus={} crashes={} signatures={} durationMs={}\n",
            self.iterations,
            self.improvements,
            self.corpus_size,
            self.crashes,
            self.crash_signatures,
            self.duration_ms
        ));
        out.push_str(&format!("workspace={}\n", self.workspace_dir));
        for op in &self.operations {
            out.push_str(&format!("  {} {:<7} {}\n", op.level, op.method.as_str(), op.path));
        }
        out.trim_end().to_string()
    }

    pub fn write_json(&self, dir: &Path) -> crate::RestFuzzResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let out = dir.join("report.json");
        std::fs::write(&out, serde_json::to_vec_pretty(self)?)?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub spec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<FuzzSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub entries: Vec<BatchEntry>,
}

impl BatchSummary {
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }

    pub fn pretty(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("== {}\n", entry.spec));
            match (&entry.summary, &entry.error) {
                (Some(summary), _) => {
                    out.push_str(&summary.pretty());
                    out.push('\n');
                }
                (None, Some(err)) => out.push_str(&format!("failed: {err}\n")),
                (None, None) => {}
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> FuzzSummary {
        FuzzSummary {
            title: "Pets".to_string(),
            run_id: "r1".to_string(),
            seed: 7,
            guided: true,
            strict: false,
            started_at: "2024-01-01T00:00:00Z".to_string(),
            finished_at: "2024-01-01T00:00:01Z".to_string(),
            duration_ms: 1000,
            iterations: 3,
            improvements: 1,
            corpus_size: 2,
            crashes: 0,
            crash_signatures: 0,
            coverage: CoverageVector(vec![6, 2]),
            operations: vec![
                OperationLevel {
                    path: "/pets".to_string(),
                    method: Method::Post,
                    level: 6,
                },
                OperationLevel {
                    path: "/pets".to_string(),
                    method: Method::Get,
                    level: 2,
                },
            ],
            workspace_dir: ".restfuzz/Pets".to_string(),
        }
    }

    #[test]
    fn pretty_lists_operation_levels() {
        let text = summary().pretty();
        assert!(text.contains("seed=7"));
        assert!(text.contains("  6 POST    /pets"));
        assert!(text.contains("  2 GET     /pets"));
    }

    #[test]
    fn json_uses_camel_case_keys() {
        let json = serde_json::to_value(summary()).expect("json");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["corpusSize"], 2);
        assert_eq!(json["coverage"], serde_json::json!([6, 2]));
    }

    #[test]
    fn batch_counts_failures() {
        let batch = BatchSummary {
            entries: vec![
                BatchEntry {
                    spec: "a.yaml".to_string(),
                    summary: Some(summary()),
                    error: None,
                },
                BatchEntry {
                    spec: "b.yaml".to_string(),
                    summary: None,
                    error: Some("configuration error: document has no paths".to_string()),
                },
            ],
        };
        assert_eq!(batch.failed(), 1);
        assert!(batch.pretty().contains("failed: configuration error"));
    }
}
