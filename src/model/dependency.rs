//! Declared inter-operation dependencies (`Dependency.yml`).

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::Path;

use crate::{ApiSpec, Method, RestFuzzError, RestFuzzResult};

/// Source path marking an item that has no producing operation.
pub const NO_SOURCE: &str = "x";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyFile {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub paths: BTreeMap<String, DependencyInfo>,
    /// Required follow-up flows of POST paths, used for the top coverage tier.
    #[serde(default)]
    pub posts: BTreeMap<String, DependencyPost>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyInfo {
    #[serde(default)]
    pub items: Vec<DependencyItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyItem {
    /// Request key whose value comes from an earlier response.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub source: DependencySource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySource {
    #[serde(default)]
    pub path: String,
    /// Key path into the source response, e.g. `data[{id}]`.
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyPost {
    #[serde(default)]
    pub flows: Vec<FlowItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowItem {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
}

impl DependencyItem {
    pub fn has_source(&self) -> bool {
        !self.source.path.is_empty() && self.source.path != NO_SOURCE
    }
}

impl DependencyFile {
    pub fn load(path: &Path) -> RestFuzzResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> RestFuzzResult<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Skeleton for an operator to fill in: one empty item per path and, for
    /// every path with a POST, template follow-up flows.
    pub fn template(spec: &ApiSpec) -> Self {
        let mut out = Self {
            count: spec.paths.len(),
            ..Self::default()
        };
        for (path, item) in &spec.paths {
            out.paths.insert(
                path.clone(),
                DependencyInfo {
                    items: vec![DependencyItem::default()],
                },
            );
            if item.operations.contains_key(&Method::Post) {
                let flows = [Method::Get, Method::Get, Method::Patch, Method::Delete]
                    .into_iter()
                    .map(|m| FlowItem {
                        method: m.as_str().to_string(),
                        path: String::new(),
                    })
                    .collect();
                out.posts.insert(path.clone(), DependencyPost { flows });
            }
        }
        out
    }

    /// Checks that the file is filled in and consistent with the API description.
    pub fn validate(&self, spec: &ApiSpec) -> RestFuzzResult<()> {
        for path in spec.paths.keys() {
            if !self.paths.contains_key(path) {
                return Err(RestFuzzError::Config(format!("dependency file is missing path {path:?}")));
            }
        }
        for (path, info) in &self.paths {
            if !spec.paths.contains_key(path) {
                return Err(RestFuzzError::Config(format!("dependency file names unknown path {path:?}")));
            }
            for item in &info.items {
                if item.source.path.is_empty() {
                    return Err(RestFuzzError::Config(format!(
                        "dependency item of {path:?} has no source path (use {NO_SOURCE:?} for none)"
                    )));
                }
                if item.has_source() && !spec.paths.contains_key(&item.source.path) {
                    return Err(RestFuzzError::Config(format!(
                        "dependency item of {path:?} refers to unknown path {:?}",
                        item.source.path
                    )));
                }
            }
        }
        for (path, post) in &self.posts {
            for flow in post.flows.iter().filter(|f| !f.path.is_empty()) {
                let method: Method = flow.method.parse()?;
                if spec.operation(&flow.path, method).is_none() {
                    return Err(RestFuzzError::Config(format!(
                        "flow of POST {path:?} refers to missing operation {method} {:?}",
                        flow.path
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySegment {
    Field(String),
    /// First element of an array.
    First,
}

/// Lookup path into a JSON response. `{name}` (or bare text) selects a field,
/// `[` steps into the first array element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPath(pub Vec<KeySegment>);

impl KeyPath {
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut pending = String::new();
        fn flush(pending: &mut String, segments: &mut Vec<KeySegment>) {
            if !pending.is_empty() {
                segments.push(KeySegment::Field(std::mem::take(pending)));
            }
        }
        for c in raw.chars() {
            match c {
                '{' | '}' | ']' => flush(&mut pending, &mut segments),
                '[' => {
                    flush(&mut pending, &mut segments);
                    segments.push(KeySegment::First);
                }
                _ => pending.push(c),
            }
        }
        flush(&mut pending, &mut segments);
        Self(segments)
    }

    pub fn lookup<'a>(&self, json: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut cur = json;
        for seg in &self.0 {
            cur = match seg {
                KeySegment::Field(name) => cur.get(name.as_str())?,
                KeySegment::First => cur.as_array()?.first()?,
            };
        }
        Some(cur)
    }
}
