//! Plan generation from the API description.

use std::collections::BTreeMap;

use crate::{ApiSpec, CallNode, DependencyResolver, Location, Method, OperationSpec, Request, TestPlan, Value};

/// Fixed global ordering of operations: sorted paths, then method priority.
/// Coverage vectors are positionally aligned with this index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationIndex {
    entries: Vec<(String, Method)>,
    positions: BTreeMap<(String, Method), usize>,
}

impl OperationIndex {
    pub fn new(spec: &ApiSpec) -> Self {
        let mut out = Self::default();
        for (path, item) in &spec.paths {
            for method in Method::PRIORITY {
                if item.operations.contains_key(&method) {
                    out.positions.insert((path.clone(), method), out.entries.len());
                    out.entries.push((path.clone(), method));
                }
            }
        }
        out
    }

    pub fn position(&self, path: &str, method: Method) -> Option<usize> {
        self.positions.get(&(path.to_string(), method)).copied()
    }

    pub fn get(&self, position: usize) -> Option<(&str, Method)> {
        self.entries.get(position).map(|(p, m)| (p.as_str(), *m))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Method)> {
        self.entries.iter().map(|(p, m)| (p.as_str(), *m))
    }
}

pub struct GrammarBuilder<'a> {
    spec: &'a ApiSpec,
    resolver: &'a DependencyResolver,
}

impl<'a> GrammarBuilder<'a> {
    pub fn new(spec: &'a ApiSpec, resolver: &'a DependencyResolver) -> Self {
        Self { spec, resolver }
    }

    /// One group per top-level path, each expanded through its flow order.
    /// DELETE nodes of a group run after everything else in that group, in
    /// reverse flow order so child resources go before their parents.
    pub fn build(&self) -> TestPlan {
        let mut nodes = Vec::new();
        for (group, path) in (1u32..).zip(self.spec.paths.keys()) {
            let mut deletes = Vec::new();
            for step in self.resolver.flow_order(path) {
                let mut step_deletes = Vec::new();
                for method in Method::PRIORITY {
                    let Some(op) = self.spec.operation(&step, method) else {
                        continue;
                    };
                    for _ in op.included_responses() {
                        let node = self.node(group, &step, method, op);
                        if method == Method::Delete {
                            step_deletes.push(node);
                        } else {
                            nodes.push(node);
                        }
                    }
                }
                step_deletes.append(&mut deletes);
                deletes = step_deletes;
            }
            nodes.append(&mut deletes);
        }
        TestPlan { nodes }
    }

    fn node(&self, group: u32, path: &str, method: Method, op: &OperationSpec) -> CallNode {
        let mut requests: Vec<Request> = self
            .spec
            .merged_parameters(path, method)
            .into_iter()
            .map(|p| Request {
                location: p.location.clone(),
                value: Value::Object(BTreeMap::from([(p.name.clone(), Value::from_json(&p.example))])),
            })
            .collect();
        for media in op.request_body.iter().filter(|m| crate::is_json_type(&m.content_type)) {
            requests.push(Request {
                location: Location::Body(media.content_type.clone()),
                value: Value::from_json(&media.example),
            });
        }
        CallNode {
            group,
            path: path.to_string(),
            method,
            requests,
        }
    }
}
