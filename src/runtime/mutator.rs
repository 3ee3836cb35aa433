//! Structured mutation of test plans plus a corpus-free byte mutator.

use rand_chacha::ChaCha20Rng;
use rand_core::RngCore as _;

use crate::{CallNode, DependencyResolver, GroupResponseCache, NodeLeaf, RestFuzzResult, TestPlan, Value};

const INTERESTING: [u8; 10] = [0x00, 0x01, 0x20, 0x7f, 0x80, 0xff, b'-', b'0', b'%', b'"'];

/// Byte-level mutator over a single input.
#[derive(Debug, Clone, Copy)]
pub struct ByteMutator {
    pub max_len: usize,
}

impl ByteMutator {
    pub fn new(max_len: usize) -> Self {
        Self { max_len: max_len.max(1) }
    }

    /// Applies between one and four stacked edits.
    pub fn mutate(&self, buf: &mut Vec<u8>, rng: &mut ChaCha20Rng) {
        let rounds = 1 + rng.next_u64() % 4;
        for _ in 0..rounds {
            match rng.next_u64() % 8 {
                0 => bitflip(buf, rng),
                1 => set_byte(buf, rng),
                2 => swap_bytes(buf, rng),
                3 => arith(buf, rng),
                4 => insert_chunk(buf, rng, self.max_len),
                5 => delete_chunk(buf, rng),
                6 => duplicate_chunk(buf, rng, self.max_len),
                _ => interesting_byte(buf, rng),
            }
        }
        buf.truncate(self.max_len);
    }
}

fn pick(rng: &mut ChaCha20Rng, n: usize) -> usize {
    (rng.next_u64() as usize) % n
}

fn bitflip(buf: &mut [u8], rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    let idx = pick(rng, buf.len());
    buf[idx] ^= 1u8 << pick(rng, 8);
}

fn set_byte(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng) {
    let val = (rng.next_u64() & 0xFF) as u8;
    if buf.is_empty() {
        buf.push(val);
        return;
    }
    let idx = pick(rng, buf.len());
    buf[idx] = val;
}

fn swap_bytes(buf: &mut [u8], rng: &mut ChaCha20Rng) {
    if buf.len() < 2 {
        return;
    }
    let a = pick(rng, buf.len());
    let b = pick(rng, buf.len());
    buf.swap(a, b);
}

fn arith(buf: &mut [u8], rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    let idx = pick(rng, buf.len());
    let delta = 1 + pick(rng, 35) as u8;
    buf[idx] = if rng.next_u64() % 2 == 0 {
        buf[idx].wrapping_add(delta)
    } else {
        buf[idx].wrapping_sub(delta)
    };
}

fn insert_chunk(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng, max_len: usize) {
    if buf.len() >= max_len {
        return;
    }
    let room = (max_len - buf.len()).min(16);
    let len = 1 + pick(rng, room);
    let at = pick(rng, buf.len() + 1);
    let chunk: Vec<u8> = (0..len).map(|_| (rng.next_u64() & 0xFF) as u8).collect();
    buf.splice(at..at, chunk);
}

fn delete_chunk(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng) {
    if buf.is_empty() {
        return;
    }
    let at = pick(rng, buf.len());
    let len = 1 + pick(rng, (buf.len() - at).min(16));
    buf.drain(at..at + len);
}

fn duplicate_chunk(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng, max_len: usize) {
    if buf.is_empty() || buf.len() >= max_len {
        return;
    }
    let at = pick(rng, buf.len());
    let len = 1 + pick(rng, (buf.len() - at).min(max_len - buf.len()).min(16));
    let chunk = buf[at..at + len].to_vec();
    let dest = pick(rng, buf.len() + 1);
    buf.splice(dest..dest, chunk);
}

fn interesting_byte(buf: &mut Vec<u8>, rng: &mut ChaCha20Rng) {
    let val = INTERESTING[pick(rng, INTERESTING.len())];
    if buf.is_empty() {
        buf.push(val);
        return;
    }
    let idx = pick(rng, buf.len());
    buf[idx] = val;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafAction {
    Delete,
    TypeConfusion,
    Bytes,
}

impl LeafAction {
    /// Delete and type confusion each 1/5, byte mutation 3/5.
    pub fn draw(rng: &mut ChaCha20Rng) -> Self {
        match rng.next_u64() % 5 {
            0 => Self::Delete,
            1 => Self::TypeConfusion,
            _ => Self::Bytes,
        }
    }
}

/// Picks `picks` distinct indices out of `len`, or every index when there are
/// fewer than `picks` leaves.
pub fn select_leaves(len: usize, picks: usize, rng: &mut ChaCha20Rng) -> Vec<usize> {
    if len < picks || picks == 0 {
        return (0..len).collect();
    }
    let mut pool: Vec<usize> = (0..len).collect();
    for i in 0..picks {
        let j = i + pick(rng, len - i);
        pool.swap(i, j);
    }
    pool.truncate(picks);
    pool
}

#[derive(Debug, Clone, Copy)]
pub struct MutationEngine {
    pub picks: usize,
    pub bytes: ByteMutator,
}

impl MutationEngine {
    pub fn new(picks: usize, max_value_bytes: usize) -> Self {
        Self {
            picks,
            bytes: ByteMutator::new(max_value_bytes),
        }
    }

    /// Mutates every node of the plan in place.
    pub fn mutate(
        &self,
        plan: &mut TestPlan,
        resolver: &DependencyResolver,
        cache: &GroupResponseCache,
        rng: &mut ChaCha20Rng,
    ) -> RestFuzzResult<()> {
        for node in &mut plan.nodes {
            self.mutate_node(node, resolver, cache, rng)?;
        }
        Ok(())
    }

    pub fn mutate_node(
        &self,
        node: &mut CallNode,
        resolver: &DependencyResolver,
        cache: &GroupResponseCache,
        rng: &mut ChaCha20Rng,
    ) -> RestFuzzResult<()> {
        let leaves = node.leaves()?;
        for at in &leaves {
            if resolver.is_related(&node.path, &at.leaf.key) {
                resolver.resolve_leaf(node, at, cache);
            }
        }
        for idx in select_leaves(leaves.len(), self.picks, rng) {
            let action = LeafAction::draw(rng);
            self.apply(node, &leaves[idx], action, rng);
        }
        Ok(())
    }

    /// Applies one action to one leaf. A leaf already removed by an earlier
    /// delete in the same pass is left alone.
    pub fn apply(&self, node: &mut CallNode, at: &NodeLeaf, action: LeafAction, rng: &mut ChaCha20Rng) {
        if action == LeafAction::Delete {
            if let Some(request) = node.requests.get_mut(at.request) {
                request.value.remove_owning_key(&at.leaf.path);
            }
            return;
        }
        let Some(slot) = node.leaf_value_mut(at) else {
            return;
        };
        let next = match action {
            LeafAction::TypeConfusion => confuse(slot, rng),
            _ => {
                let mut raw = slot.render(false);
                self.bytes.mutate(&mut raw, rng);
                rewrap(slot, &raw)
            }
        };
        if let Some(next) = next {
            *slot = next;
        }
    }
}

/// An even first byte reads as `true`; no byte reads as `false`.
fn parity(b: Option<&u8>) -> bool {
    b.is_some_and(|b| b % 2 == 0)
}

fn first_as_number(b: Option<&u8>) -> Value {
    Value::Number(b.map(|b| f64::from(*b)).unwrap_or(0.0))
}

/// Swaps the scalar kind, seeded by the first byte of the decoded form.
fn confuse(value: &Value, rng: &mut ChaCha20Rng) -> Option<Value> {
    let raw = value.render(false);
    let first = raw.first();
    let coin = rng.next_u64() % 2 == 0;
    Some(match value {
        Value::Number(_) if coin => Value::Bool(parity(first)),
        Value::Number(_) => first_as_number(first),
        Value::String(_) if coin => first_as_number(first),
        Value::String(_) => Value::Bool(parity(first)),
        Value::Bool(_) if coin => Value::from_bytes(&raw),
        Value::Bool(_) => first_as_number(first),
        Value::Null if coin => Value::Bool(false),
        Value::Null => Value::Number(0.0),
        Value::List(_) | Value::Object(_) => return None,
    })
}

/// Re-wraps mutated bytes as the original scalar kind.
fn rewrap(value: &Value, raw: &[u8]) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(Value::Bool(parity(raw.first()))),
        Value::Number(_) => Some(first_as_number(raw.first())),
        Value::String(_) => Some(Value::from_bytes(raw)),
        Value::Null | Value::List(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Location, Method, Request, RestFuzzError};
    use rand_core::SeedableRng as _;
    use std::collections::BTreeMap;

    fn rng(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    fn node(fields: Vec<(&str, Value)>) -> CallNode {
        CallNode {
            group: 1,
            path: "/items".to_string(),
            method: Method::Post,
            requests: vec![Request {
                location: Location::Body("application/json".to_string()),
                value: Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
            }],
        }
    }

    #[test]
    fn selection_is_distinct_and_roughly_uniform() {
        let mut r = rng(7);
        let mut hits = [0u32; 3];
        for _ in 0..1000 {
            let picked = select_leaves(3, 2, &mut r);
            assert_eq!(picked.len(), 2);
            assert_ne!(picked[0], picked[1]);
            for i in picked {
                hits[i] += 1;
            }
        }
        // Each leaf is expected in 2/3 of the runs.
        for h in hits {
            assert!((580..=750).contains(&h), "uneven selection: {hits:?}");
        }
    }

    #[test]
    fn fewer_leaves_than_picks_selects_all() {
        let mut r = rng(1);
        assert_eq!(select_leaves(1, 2, &mut r), vec![0]);
        assert!(select_leaves(0, 2, &mut r).is_empty());
    }

    #[test]
    fn mutate_touches_at_most_two_of_three_leaves() {
        let engine = MutationEngine::new(2, 64);
        let resolver = DependencyResolver::unconstrained();
        let cache = GroupResponseCache::new();
        let base = node(vec![
            ("a", Value::text("alpha")),
            ("b", Value::text("bravo")),
            ("c", Value::text("charlie")),
        ]);
        let mut r = rng(11);
        for _ in 0..200 {
            let mut n = base.clone();
            engine.mutate_node(&mut n, &resolver, &cache, &mut r).expect("mutate");
            let Value::Object(before) = &base.requests[0].value else { panic!() };
            let Value::Object(after) = &n.requests[0].value else { panic!() };
            let unchanged = before.iter().filter(|(k, v)| after.get(*k) == Some(*v)).count();
            assert!(unchanged >= 1, "more than two leaves changed");
        }
    }

    #[test]
    fn delete_removes_owning_key() {
        let engine = MutationEngine::new(2, 64);
        let mut n = node(vec![("tags", Value::List(vec![Value::text("x")])), ("id", Value::Number(1.0))]);
        let leaves = n.leaves().expect("leaves");
        engine.apply(&mut n, &leaves[1], LeafAction::Delete, &mut rng(0));
        let Value::Object(map) = &n.requests[0].value else { panic!() };
        assert!(!map.contains_key("tags"));
        assert!(map.contains_key("id"));
    }

    #[test]
    fn type_confusion_changes_scalar_kind() {
        let mut r = rng(3);
        for _ in 0..50 {
            let s = confuse(&Value::text("abc"), &mut r).expect("scalar");
            assert!(matches!(s, Value::Number(n) if n == 97.0) || s == Value::Bool(false));

            let s = confuse(&Value::text("bcd"), &mut r).expect("scalar");
            assert!(matches!(s, Value::Number(n) if n == 98.0) || s == Value::Bool(true));

            let b = confuse(&Value::Bool(true), &mut r).expect("scalar");
            assert!(b == Value::text("true") || b == Value::Number(116.0));

            let e = confuse(&Value::text(""), &mut r).expect("scalar");
            assert!(e == Value::Number(0.0) || e == Value::Bool(false));
        }
        assert!(confuse(&Value::List(vec![]), &mut r).is_none());
    }

    #[test]
    fn rewrapped_bool_follows_first_byte_parity() {
        assert_eq!(rewrap(&Value::Bool(false), &[2, 1]), Some(Value::Bool(true)));
        assert_eq!(rewrap(&Value::Bool(true), &[3]), Some(Value::Bool(false)));
        assert_eq!(rewrap(&Value::Bool(true), &[]), Some(Value::Bool(false)));
        assert_eq!(rewrap(&Value::Null, &[2]), None);
    }

    #[test]
    fn byte_mutation_keeps_kind_and_respects_cap() {
        let engine = MutationEngine::new(2, 8);
        let mut r = rng(5);
        for _ in 0..200 {
            let mut n = node(vec![("s", Value::text("abcdefgh")), ("n", Value::Number(5.0))]);
            let leaves = n.leaves().expect("leaves");
            for at in &leaves {
                engine.apply(&mut n, at, LeafAction::Bytes, &mut r);
            }
            let Value::Object(map) = &n.requests[0].value else { panic!() };
            assert!(map["s"].render(false).len() <= 8);
            assert_eq!(map["n"].kind_name(), "number");
        }
    }

    #[test]
    fn triple_nested_list_is_fatal() {
        let engine = MutationEngine::new(2, 64);
        let nested = Value::List(vec![Value::List(vec![Value::List(vec![Value::Number(1.0)])])]);
        let mut n = node(vec![("deep", nested)]);
        let err = engine
            .mutate_node(&mut n, &DependencyResolver::unconstrained(), &GroupResponseCache::new(), &mut rng(0))
            .expect_err("must fail");
        assert!(matches!(err, RestFuzzError::Data(_)));
    }

    #[test]
    fn dependency_values_are_substituted_before_mutation() {
        let spec = crate::ApiSpec::from_document(&serde_json::json!({
            "openapi": "3.0.0",
            "paths": {"/items": {"post": {"responses": {"201": {}}}}, "/owners": {"post": {"responses": {"201": {}}}}}
        }))
        .expect("spec");
        let deps: crate::DependencyFile = serde_yaml::from_str(
            "paths:\n  /items:\n    items:\n      - { key: owner, source: { path: /owners, key: id } }\n",
        )
        .expect("deps");
        let resolver = DependencyResolver::new(&spec, Some(&deps), true).expect("resolver");
        let mut cache = GroupResponseCache::new();
        cache.insert(1, "/owners", serde_json::json!({"id": 99}));

        let mut n = node(vec![("owner", Value::Number(0.0))]);
        let leaves = n.leaves().expect("leaves");
        assert!(resolver.resolve_leaf(&mut n, &leaves[0], &cache));
        let Value::Object(map) = &n.requests[0].value else { panic!() };
        assert_eq!(map["owner"], Value::Number(99.0));

        // With four leaves and two picks the related leaf is often left
        // unselected, and then it must carry the substituted value.
        let engine = MutationEngine::new(2, 64);
        let base = node(vec![
            ("owner", Value::Number(0.0)),
            ("x", Value::text("a")),
            ("y", Value::text("b")),
            ("z", Value::text("c")),
        ]);
        let mut r = rng(9);
        let mut substituted = 0;
        for _ in 0..20 {
            let mut m = base.clone();
            engine.mutate_node(&mut m, &resolver, &cache, &mut r).expect("mutate");
            let Value::Object(map) = &m.requests[0].value else { panic!() };
            if map.get("owner") == Some(&Value::Number(99.0)) {
                substituted += 1;
            }
        }
        assert!(substituted > 0);
    }

    #[test]
    fn byte_mutator_changes_input_eventually() {
        let m = ByteMutator::new(64);
        let mut r = rng(2);
        let mut changed = 0;
        for _ in 0..100 {
            let mut buf = b"hello".to_vec();
            m.mutate(&mut buf, &mut r);
            if buf != b"hello" {
                changed += 1;
            }
        }
        assert!(changed > 50);
    }

    #[test]
    fn map_is_untouched_when_nothing_selected() {
        let engine = MutationEngine::new(2, 64);
        let mut n = CallNode {
            group: 1,
            path: "/empty".to_string(),
            method: Method::Get,
            requests: vec![Request {
                location: Location::Query,
                value: Value::Object(BTreeMap::new()),
            }],
        };
        let before = n.clone();
        engine
            .mutate_node(&mut n, &DependencyResolver::unconstrained(), &GroupResponseCache::new(), &mut rng(0))
            .expect("mutate");
        assert_eq!(n, before);
    }
}
