//! Test plans: ordered call nodes carrying typed request values.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::{flatten_leaves, Leaf, RestFuzzError, RestFuzzResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Options,
    Head,
    Post,
    Put,
    Patch,
    Get,
    Delete,
    Trace,
}

impl Method {
    /// Fixed priority order used for plan generation and coverage positions.
    pub const PRIORITY: [Method; 8] = [
        Method::Options,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Get,
        Method::Delete,
        Method::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RestFuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PRIORITY
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RestFuzzError::Config(format!("unknown http method {s:?}")))
    }
}

/// Where a request's values go on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Location {
    Path,
    Query,
    Header,
    Cookie,
    /// Request body with the given content type.
    Body(String),
}

impl Location {
    pub fn tag(&self) -> &str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Body(content_type) => content_type,
        }
    }

    pub fn is_json_body(&self) -> bool {
        matches!(self, Self::Body(ct) if is_json_type(ct))
    }
}

impl From<String> for Location {
    fn from(s: String) -> Self {
        match s.as_str() {
            "path" => Self::Path,
            "query" => Self::Query,
            "header" => Self::Header,
            "cookie" => Self::Cookie,
            _ => Self::Body(s),
        }
    }
}

impl From<Location> for String {
    fn from(loc: Location) -> Self {
        loc.tag().to_string()
    }
}

pub fn is_json_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("json")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub location: Location,
    /// Object of key -> value for this location.
    pub value: Value,
}

impl Request {
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        match &self.value {
            Value::Object(map) => Some(map.iter()),
            _ => None,
        }
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    pub group: u32,
    pub path: String,
    pub method: Method,
    pub requests: Vec<Request>,
}

/// A scalar inside one of a node's requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLeaf {
    pub request: usize,
    pub leaf: Leaf,
}

impl CallNode {
    /// All scalar leaves across the node's requests, request by request.
    pub fn leaves(&self) -> RestFuzzResult<Vec<NodeLeaf>> {
        let mut out = Vec::new();
        for (request, r) in self.requests.iter().enumerate() {
            for (k, v) in r.fields() {
                for leaf in flatten_leaves(k, v)? {
                    out.push(NodeLeaf { request, leaf });
                }
            }
        }
        Ok(out)
    }

    pub fn leaf_value(&self, at: &NodeLeaf) -> Option<&Value> {
        self.requests.get(at.request)?.value.get_path(&at.leaf.path)
    }

    pub fn leaf_value_mut(&mut self, at: &NodeLeaf) -> Option<&mut Value> {
        self.requests.get_mut(at.request)?.value.get_path_mut(&at.leaf.path)
    }

    /// Crash signature source: the path followed by every request location tag.
    pub fn crash_key(&self) -> String {
        let mut name = self.path.clone();
        for r in &self.requests {
            name.push_str(r.location.tag());
        }
        name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    pub nodes: Vec<CallNode>,
}

impl TestPlan {
    pub fn to_bytes(&self) -> RestFuzzResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> RestFuzzResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| RestFuzzError::Data(format!("undecodable test plan: {e}")))
    }
}
