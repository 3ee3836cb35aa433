//! `restfuzz init`: template Token/Dependency/Info files for an API description.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::Path;

use crate::{ApiSpec, DependencyFile, RestFuzzResult, TokenConfig, Workspace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoParameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: String,
    pub example: serde_json::Value,
}

/// Operator reference: every operation's inputs with their generated examples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoFile {
    pub title: String,
    pub paths: BTreeMap<String, BTreeMap<String, Vec<InfoParameter>>>,
}

impl InfoFile {
    pub fn from_spec(spec: &ApiSpec) -> Self {
        let mut out = Self {
            title: spec.title.clone(),
            paths: BTreeMap::new(),
        };
        for (path, item) in &spec.paths {
            let methods = out.paths.entry(path.clone()).or_default();
            for (method, op) in &item.operations {
                let mut params: Vec<InfoParameter> = spec
                    .merged_parameters(path, *method)
                    .into_iter()
                    .map(|p| InfoParameter {
                        name: p.name.clone(),
                        location: p.location.tag().to_string(),
                        example: p.example.clone(),
                    })
                    .collect();
                for media in &op.request_body {
                    params.push(InfoParameter {
                        name: "body".to_string(),
                        location: media.content_type.clone(),
                        example: media.example.clone(),
                    });
                }
                methods.insert(method.as_str().to_string(), params);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitReport {
    pub workspace: String,
    pub written: Vec<String>,
    pub existing: Vec<String>,
}

/// Writes every template that is not already present in the workspace.
pub fn init_workspace(spec: &ApiSpec, ws: &Workspace) -> RestFuzzResult<InitReport> {
    std::fs::create_dir_all(ws.root())?;
    let mut report = InitReport {
        workspace: ws.root().display().to_string(),
        ..InitReport::default()
    };

    let token = ws.token_path();
    write_if_absent(&token, &mut report, |p| TokenConfig::template().save(p))?;
    let deps = ws.dependency_path();
    write_if_absent(&deps, &mut report, |p| DependencyFile::template(spec).save(p))?;
    let info = ws.info_path();
    write_if_absent(&info, &mut report, |p| {
        std::fs::write(p, serde_yaml::to_string(&InfoFile::from_spec(spec))?)?;
        Ok(())
    })?;
    Ok(report)
}

fn write_if_absent(
    path: &Path,
    report: &mut InitReport,
    write: impl FnOnce(&Path) -> RestFuzzResult<()>,
) -> RestFuzzResult<()> {
    let shown = path.display().to_string();
    if path.exists() {
        report.existing.push(shown);
        return Ok(());
    }
    write(path)?;
    tracing::info!("wrote template {shown}");
    report.written.push(shown);
    Ok(())
}
