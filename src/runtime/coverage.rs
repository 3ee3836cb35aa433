//! Per-operation coverage levels and the global coverage vector.
//!
//! Levels:
//! 0 not executed, 2 content types missing, 3 too few parameters or a
//! status class missing, 4 a status code missing, 5 too few response
//! properties, 6 everything covered, 7 (strict) a POST whose required
//! follow-up flows all reached 6 in the same iteration.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::fmt;

use crate::{json_keys, ApiSpec, CallNode, Config, DependencyResolver, Method, OperationIndex, Outcome, RestFuzzError, RestFuzzResult};

pub const LEVEL_UNREACHED: u8 = 0;
pub const LEVEL_FULL: u8 = 6;
pub const LEVEL_FLOWS: u8 = 7;

/// Content type without parameters, lowercased.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub input_types: BTreeSet<String>,
    pub params: BTreeSet<String>,
    pub output_types: BTreeSet<String>,
    pub classes: BTreeSet<u16>,
    pub codes: BTreeSet<u16>,
    pub properties: BTreeSet<String>,
}

impl Criteria {
    /// Targets declared for one operation.
    pub fn goal(spec: &ApiSpec, path: &str, method: Method) -> Self {
        let mut out = Self::default();
        let Some(op) = spec.operation(path, method) else {
            return out;
        };
        for p in spec.merged_parameters(path, method) {
            out.params.insert(p.name.clone());
        }
        for media in op.request_body.iter().filter(|m| crate::is_json_type(&m.content_type)) {
            out.input_types.insert(media_type(&media.content_type));
            if let serde_json::Value::Object(map) = &media.example {
                out.params.extend(map.keys().cloned());
            }
        }
        for resp in op.included_responses() {
            let Some(code) = resp.code() else {
                continue;
            };
            out.codes.insert(code);
            out.classes.insert(code / 100);
            for media in resp.content.iter().filter(|m| crate::is_json_type(&m.content_type)) {
                out.output_types.insert(media_type(&media.content_type));
                let mut keys = Vec::new();
                json_keys(&media.example, &mut keys);
                out.properties.extend(keys);
            }
        }
        out
    }

    /// Adds what one executed node sent and received.
    pub fn observe(&mut self, node: &CallNode, outcome: &Outcome) {
        for request in &node.requests {
            if let crate::Location::Body(content_type) = &request.location {
                self.input_types.insert(media_type(content_type));
            }
            self.params.extend(request.fields().map(|(k, _)| k.clone()));
        }
        if !outcome.content_type.is_empty() {
            self.output_types.insert(media_type(&outcome.content_type));
        }
        self.codes.insert(outcome.status);
        self.classes.insert(outcome.status / 100);
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&outcome.body) {
            let mut keys = Vec::new();
            json_keys(&json, &mut keys);
            self.properties.extend(keys);
        }
    }
}

/// Share of `goal` present in `seed`; an empty goal counts as fully covered.
pub fn coverage_ratio<T: Ord>(goal: &BTreeSet<T>, seed: &BTreeSet<T>) -> f64 {
    if goal.is_empty() {
        return 1.0;
    }
    goal.intersection(seed).count() as f64 / goal.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub parameters: f64,
    pub properties: f64,
}

impl Thresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parameters: config.parameter_threshold,
            properties: config.property_threshold,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            parameters: 0.5,
            properties: 0.5,
        }
    }
}

/// Level 2..=6 for an executed operation.
pub fn base_level(goal: &Criteria, seed: &Criteria, thresholds: Thresholds) -> u8 {
    if !goal.input_types.is_subset(&seed.input_types) || !goal.output_types.is_subset(&seed.output_types) {
        return 2;
    }
    if coverage_ratio(&goal.params, &seed.params) < thresholds.parameters {
        return 3;
    }
    if goal
        .classes
        .iter()
        .filter(|c| **c != 3 && **c != 5)
        .any(|c| !seed.classes.contains(c))
    {
        return 3;
    }
    if !goal.codes.is_subset(&seed.codes) {
        return 4;
    }
    if coverage_ratio(&goal.properties, &seed.properties) < thresholds.properties {
        return 5;
    }
    LEVEL_FULL
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageVector(pub Vec<u8>);

impl CoverageVector {
    pub fn zeroed(len: usize) -> Self {
        Self(vec![LEVEL_UNREACHED; len])
    }

    pub fn levels(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pointwise maximum with `other`. Returns whether any position increased.
    pub fn merge(&mut self, other: &CoverageVector) -> bool {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), LEVEL_UNREACHED);
        }
        let mut improved = false;
        for (mine, theirs) in self.0.iter_mut().zip(&other.0) {
            if *theirs > *mine {
                *mine = *theirs;
                improved = true;
            }
        }
        improved
    }
}

impl fmt::Display for CoverageVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{level}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CoverageScorer {
    index: OperationIndex,
    goals: Vec<Criteria>,
    thresholds: Thresholds,
    /// Per position: positions of the required follow-up flows (strict POSTs only).
    flows: Vec<Vec<usize>>,
}

impl CoverageScorer {
    pub fn new(
        spec: &ApiSpec,
        index: OperationIndex,
        resolver: &DependencyResolver,
        thresholds: Thresholds,
    ) -> RestFuzzResult<Self> {
        let goals = index.iter().map(|(path, method)| Criteria::goal(spec, path, method)).collect();
        let mut flows = vec![Vec::new(); index.len()];
        if resolver.is_strict() {
            for (pos, (path, method)) in index.iter().enumerate() {
                if method != Method::Post {
                    continue;
                }
                for (target, target_method) in resolver.post_flows(path) {
                    let Some(target_pos) = index.position(target, *target_method) else {
                        return Err(RestFuzzError::Config(format!(
                            "flow of POST {path:?} targets {target_method} {target:?}, which is never executed"
                        )));
                    };
                    flows[pos].push(target_pos);
                }
            }
        }
        Ok(Self {
            index,
            goals,
            thresholds,
            flows,
        })
    }

    pub fn index(&self) -> &OperationIndex {
        &self.index
    }

    pub fn goal(&self, position: usize) -> Option<&Criteria> {
        self.goals.get(position)
    }

    /// Scores one iteration's executed nodes.
    pub fn score(&self, executed: &[(CallNode, Outcome)]) -> CoverageVector {
        let mut seeds: Vec<Option<Criteria>> = vec![None; self.index.len()];
        for (node, outcome) in executed {
            let Some(pos) = self.index.position(&node.path, node.method) else {
                tracing::debug!("executed node {} {} is not an indexed operation", node.method, node.path);
                continue;
            };
            seeds[pos].get_or_insert_with(Criteria::default).observe(node, outcome);
        }

        let base: Vec<u8> = seeds
            .iter()
            .zip(&self.goals)
            .map(|(seed, goal)| match seed {
                Some(seed) => base_level(goal, seed, self.thresholds),
                None => LEVEL_UNREACHED,
            })
            .collect();

        let mut levels = base.clone();
        for (pos, targets) in self.flows.iter().enumerate() {
            if targets.is_empty() || base[pos] == LEVEL_UNREACHED {
                continue;
            }
            if targets.iter().all(|t| base[*t] >= LEVEL_FULL) {
                levels[pos] = LEVEL_FLOWS;
            }
        }
        CoverageVector(levels)
    }
}
