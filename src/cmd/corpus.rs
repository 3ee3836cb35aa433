//! Corpus and crash archive inspection.

use clap::Subcommand;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use std::path::{Path, PathBuf};

use crate::{Artifact, ArtifactStore, CallNode, RestFuzzError, RestFuzzResult, TestPlan};

#[derive(Debug, Subcommand)]
pub enum CorpusCommand {
    /// List stored plans.
    #[command(name = "ls", alias = "list")]
    List { dir: PathBuf },
    /// Add a plan file to the corpus under its digest.
    Add {
        dir: PathBuf,
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        tag: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum CrashesCommand {
    /// List archived crash signatures.
    #[command(name = "ls", alias = "list")]
    List { dir: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusEntry {
    pub digest: String,
    pub tag: u64,
    pub user: bool,
    pub bytes: usize,
    /// `None` when the bytes do not decode as a plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashEntry {
    pub signature: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

pub fn corpus_command(command: &CorpusCommand) -> RestFuzzResult<serde_json::Value> {
    match command {
        CorpusCommand::List { dir } => Ok(serde_json::to_value(list_corpus(dir)?)?),
        CorpusCommand::Add { dir, file, tag } => {
            let bytes = std::fs::read(file)?;
            let plan = TestPlan::from_bytes(&bytes)?;
            let mut store = ArtifactStore::open(dir);
            let digest = crate::digest(&bytes).to_hex().to_string();
            let added = store.add(Artifact::new(bytes).with_tag(*tag));
            store.close();
            Ok(serde_json::json!({"digest": digest, "added": added, "nodes": plan.nodes.len()}))
        }
    }
}

pub fn crashes_command(command: &CrashesCommand) -> RestFuzzResult<serde_json::Value> {
    match command {
        CrashesCommand::List { dir } => Ok(serde_json::to_value(list_crashes(dir)?)?),
    }
}

pub fn list_corpus(dir: &Path) -> RestFuzzResult<Vec<CorpusEntry>> {
    if !dir.is_dir() {
        return Err(RestFuzzError::InvalidArgument(format!("no corpus at {}", dir.display())));
    }
    let store = ArtifactStore::open(dir);
    let mut out: Vec<CorpusEntry> = store
        .iter()
        .map(|(digest, artifact)| CorpusEntry {
            digest: digest.to_hex().to_string(),
            tag: artifact.tag,
            user: artifact.user,
            bytes: artifact.data.len(),
            nodes: TestPlan::from_bytes(&artifact.data).ok().map(|p| p.nodes.len()),
        })
        .collect();
    out.sort_by(|a, b| a.digest.cmp(&b.digest));
    Ok(out)
}

pub fn list_crashes(dir: &Path) -> RestFuzzResult<Vec<CrashEntry>> {
    if !dir.is_dir() {
        return Err(RestFuzzError::InvalidArgument(format!("no crash archive at {}", dir.display())));
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("skipping crash archive entry: {err}");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("code") {
            continue;
        }
        let Some(signature) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let sibling = |kind: &str| std::fs::read_to_string(dir.join(format!("{signature}.{kind}"))).ok();
        let node: Option<CallNode> = sibling("node").and_then(|s| serde_json::from_str(&s).ok());
        out.push(CrashEntry {
            signature: signature.to_string(),
            code: std::fs::read_to_string(path)?.trim().to_string(),
            timestamp: sibling("timestamp").map(|s| s.trim().to_string()),
            method: node.as_ref().map(|n| n.method.to_string()),
            path: node.map(|n| n.path),
        });
    }
    out.sort_by(|a, b| a.signature.cmp(&b.signature));
    Ok(out)
}
