//! Typed request values.
//!
//! Leaf strings are stored base64-encoded so byte-level mutation can produce
//! arbitrary bytes while the plan itself stays valid JSON. They are decoded
//! again when a request is rendered for the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::{RestFuzzError, RestFuzzResult};

/// Consecutive list nesting deeper than this is rejected by [`flatten_leaves`].
pub const MAX_LIST_NESTING: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    /// Base64 (standard alphabet) of the raw bytes.
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A scalar position inside a request value: the key it is reported under and
/// the path from the request root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: String,
    pub path: Vec<Segment>,
}

impl Value {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::String(STANDARD.encode(bytes))
    }

    pub fn text(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    /// Converts an example value, base64-encoding every string on the way in.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::text(s),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => {
                Self::Object(map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect())
            }
        }
    }

    /// Wire form as JSON text. Decoded string bytes are written as they are,
    /// with only quotes, backslashes and control bytes escaped, so non-UTF-8
    /// leaves reach the server unchanged. Integral numbers are emitted as integers.
    pub fn to_wire_json(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_wire_json(&mut out);
        out
    }

    fn write_wire_json(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.extend_from_slice(b"null"),
            Self::Bool(b) => out.extend_from_slice(b.to_string().as_bytes()),
            Self::Number(n) => out.extend_from_slice(number_to_json(*n).to_string().as_bytes()),
            Self::String(_) => write_json_string(&self.render(false), out),
            Self::List(items) => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    item.write_wire_json(out);
                }
                out.push(b']');
            }
            Self::Object(map) => {
                out.push(b'{');
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    write_json_string(key.as_bytes(), out);
                    out.push(b':');
                    item.write_wire_json(out);
                }
                out.push(b'}');
            }
        }
    }

    /// Decoded string form of a value. Lists render either their first element
    /// or all elements joined by ", ".
    pub fn render(&self, join_lists: bool) -> Vec<u8> {
        match self {
            Self::Null => Vec::new(),
            Self::Bool(b) => b.to_string().into_bytes(),
            Self::Number(n) => format_number(*n).into_bytes(),
            Self::String(encoded) => STANDARD
                .decode(encoded)
                .unwrap_or_else(|_| encoded.as_bytes().to_vec()),
            Self::List(items) if join_lists => {
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.extend_from_slice(b", ");
                    }
                    out.extend(item.render(join_lists));
                }
                out
            }
            Self::List(items) => items.first().map(|v| v.render(join_lists)).unwrap_or_default(),
            Self::Object(_) => self.to_wire_json(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::List(_) | Self::Object(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Object(_) => "object",
        }
    }

    pub fn get_path(&self, path: &[Segment]) -> Option<&Value> {
        let mut cur = self;
        for seg in path {
            cur = match (seg, cur) {
                (Segment::Key(k), Self::Object(map)) => map.get(k)?,
                (Segment::Index(i), Self::List(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn get_path_mut(&mut self, path: &[Segment]) -> Option<&mut Value> {
        let mut cur = self;
        for seg in path {
            cur = match (seg, cur) {
                (Segment::Key(k), Self::Object(map)) => map.get_mut(k)?,
                (Segment::Index(i), Self::List(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Removes the key that owns `path` from its nearest enclosing object.
    pub fn remove_owning_key(&mut self, path: &[Segment]) -> bool {
        let Some(pos) = path.iter().rposition(|s| matches!(s, Segment::Key(_))) else {
            return false;
        };
        let Segment::Key(key) = &path[pos] else {
            return false;
        };
        match self.get_path_mut(&path[..pos]) {
            Some(Self::Object(map)) => map.remove(key).is_some(),
            _ => false,
        }
    }
}

/// Flattens every scalar under `value` (reported as `key` at the top level).
/// Objects reset the list-nesting count; a list nested more than
/// [`MAX_LIST_NESTING`] levels inside other lists is an error.
pub fn flatten_leaves(key: &str, value: &Value) -> RestFuzzResult<Vec<Leaf>> {
    let mut out = Vec::new();
    let mut path = vec![Segment::Key(key.to_string())];
    flatten_into(key, value, &mut path, 0, &mut out)?;
    Ok(out)
}

fn flatten_into(
    key: &str,
    value: &Value,
    path: &mut Vec<Segment>,
    list_depth: usize,
    out: &mut Vec<Leaf>,
) -> RestFuzzResult<()> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                path.push(Segment::Key(k.clone()));
                flatten_into(k, v, path, 0, out)?;
                path.pop();
            }
        }
        Value::List(items) => {
            if list_depth >= MAX_LIST_NESTING {
                return Err(RestFuzzError::Data(format!("recursive list under key {key:?}")));
            }
            for (i, item) in items.iter().enumerate() {
                path.push(Segment::Index(i));
                flatten_into(key, item, path, list_depth + 1, out)?;
                path.pop();
            }
        }
        _ => out.push(Leaf {
            key: key.to_string(),
            path: path.clone(),
        }),
    }
    Ok(())
}

/// Every object key appearing anywhere in a JSON document.
pub fn json_keys(json: &serde_json::Value, out: &mut Vec<String>) {
    match json {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                out.push(k.clone());
                json_keys(v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                json_keys(item, out);
            }
        }
        _ => {}
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn write_json_string(raw: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    for &b in raw {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x00..=0x1f => out.extend_from_slice(format!("\\u{b:04x}").as_bytes()),
            _ => out.push(b),
        }
    }
    out.push(b'"');
}
