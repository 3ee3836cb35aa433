//! Dependency resolution between operations of one group.
//!
//! Strict mode expands each path into the chain of source paths that must run
//! before it, and later calls in a chain read values out of responses cached
//! from earlier calls in the same group.

use std::collections::{BTreeMap, HashMap};

use crate::{
    format_number, ApiSpec, CallNode, DependencyFile, DependencyItem, KeyPath, Method, NodeLeaf,
    RestFuzzError, RestFuzzResult, Value,
};

/// Last successful JSON response per (group, path) within one iteration.
#[derive(Debug, Clone, Default)]
pub struct GroupResponseCache {
    groups: HashMap<u32, HashMap<String, serde_json::Value>>,
}

impl GroupResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: u32, path: &str, body: serde_json::Value) {
        self.groups.entry(group).or_default().insert(path.to_string(), body);
    }

    /// Records a response if it is a 2xx with a JSON body; anything else is ignored.
    pub fn record(&mut self, group: u32, path: &str, status: u16, content_type: &str, body: &[u8]) -> bool {
        if !(200..300).contains(&status) || !crate::is_json_type(content_type) {
            return false;
        }
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(json) => {
                self.insert(group, path, json);
                true
            }
            Err(err) => {
                tracing::debug!("not caching undecodable response of {path}: {err}");
                false
            }
        }
    }

    pub fn get(&self, group: u32, path: &str) -> Option<&serde_json::Value> {
        self.groups.get(&group)?.get(path)
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(HashMap::is_empty)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    strict: bool,
    items: BTreeMap<String, Vec<DependencyItem>>,
    orders: BTreeMap<String, Vec<String>>,
    flows: BTreeMap<String, Vec<(String, Method)>>,
}

impl DependencyResolver {
    /// Resolver without declared dependencies: every path runs alone.
    pub fn unconstrained() -> Self {
        Self {
            strict: false,
            items: BTreeMap::new(),
            orders: BTreeMap::new(),
            flows: BTreeMap::new(),
        }
    }

    /// Builds the resolver and, in strict mode, every flow order up front so a
    /// cycle or an unknown path fails before the first request is sent.
    pub fn new(spec: &ApiSpec, deps: Option<&DependencyFile>, strict: bool) -> RestFuzzResult<Self> {
        let mut out = Self::unconstrained();
        out.strict = strict;
        let Some(deps) = deps else {
            return Ok(out);
        };

        for (path, info) in &deps.paths {
            for item in info.items.iter().filter(|i| i.has_source()) {
                if !spec.paths.contains_key(&item.source.path) {
                    return Err(RestFuzzError::Config(format!(
                        "dependency of {path:?} refers to unknown path {:?}",
                        item.source.path
                    )));
                }
            }
            out.items.insert(path.clone(), info.items.clone());
        }

        if !strict {
            return Ok(out);
        }

        for path in spec.paths.keys() {
            let mut order = Vec::new();
            let mut stack = Vec::new();
            out.expand(path, &mut stack, &mut order)?;
            out.orders.insert(path.clone(), order);
        }

        for (path, post) in &deps.posts {
            let mut parsed = Vec::new();
            for flow in post.flows.iter().filter(|f| !f.path.is_empty()) {
                let method: Method = flow.method.parse()?;
                if spec.operation(&flow.path, method).is_none() {
                    return Err(RestFuzzError::Config(format!(
                        "flow of POST {path:?} refers to missing operation {method} {:?}",
                        flow.path
                    )));
                }
                parsed.push((flow.path.clone(), method));
            }
            if !parsed.is_empty() {
                out.flows.insert(path.clone(), parsed);
            }
        }
        Ok(out)
    }

    fn expand(&self, path: &str, stack: &mut Vec<String>, order: &mut Vec<String>) -> RestFuzzResult<()> {
        if stack.iter().any(|p| p == path) {
            stack.push(path.to_string());
            return Err(RestFuzzError::Config(format!("dependency cycle: {}", stack.join(" -> "))));
        }
        stack.push(path.to_string());
        for item in self.items.get(path).into_iter().flatten().filter(|i| i.has_source()) {
            self.expand(&item.source.path, stack, order)?;
        }
        stack.pop();
        order.push(path.to_string());
        Ok(())
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Paths to execute for `path`, sources first and `path` last.
    pub fn flow_order(&self, path: &str) -> Vec<String> {
        if !self.strict {
            return vec![path.to_string()];
        }
        self.orders
            .get(path)
            .cloned()
            .unwrap_or_else(|| vec![path.to_string()])
    }

    /// Required follow-up operations of a POST path (non-empty targets only).
    pub fn post_flows(&self, path: &str) -> &[(String, Method)] {
        self.flows.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_related(&self, path: &str, key: &str) -> bool {
        self.items
            .get(path)
            .is_some_and(|items| items.iter().any(|i| i.has_source() && i.key == key))
    }

    /// Overwrites one leaf from the cached responses of its declared sources.
    /// Returns whether the leaf was changed.
    pub fn resolve_leaf(&self, node: &mut CallNode, at: &NodeLeaf, cache: &GroupResponseCache) -> bool {
        let Some(items) = self.items.get(&node.path) else {
            return false;
        };
        let mut changed = false;
        for item in items.iter().filter(|i| i.has_source() && i.key == at.leaf.key) {
            let Some(response) = cache.get(node.group, &item.source.path) else {
                continue;
            };
            let Some(found) = KeyPath::parse(&item.source.key).lookup(response) else {
                continue;
            };
            let Some(slot) = node.leaf_value_mut(at) else {
                return changed;
            };
            if let Some(value) = convert_like(slot, found) {
                *slot = value;
                changed = true;
            }
        }
        changed
    }

    /// Runs [`Self::resolve_leaf`] over every related leaf of the node.
    pub fn resolve_node(&self, node: &mut CallNode, cache: &GroupResponseCache) -> RestFuzzResult<usize> {
        if !self.items.contains_key(&node.path) {
            return Ok(0);
        }
        let mut changed = 0;
        for at in node.leaves()? {
            if self.is_related(&node.path, &at.leaf.key) && self.resolve_leaf(node, &at, cache) {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Converts a response value into the scalar kind already held by `slot`.
fn convert_like(slot: &Value, found: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as Json;
    match (slot, found) {
        (Value::Number(_), Json::Number(n)) => n.as_f64().map(Value::Number),
        (Value::Number(_), Json::String(s)) => s.trim().parse::<f64>().ok().map(Value::Number),
        (Value::String(_), Json::String(s)) => Some(Value::text(s)),
        (Value::String(_), Json::Number(n)) => n.as_f64().map(|f| Value::text(&format_number(f))),
        (Value::Bool(_), Json::Bool(b)) => Some(Value::Bool(*b)),
        (Value::Null, Json::Bool(_) | Json::Number(_) | Json::String(_)) => Some(Value::from_json(found)),
        _ => None,
    }
}
