// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision value objects.
//!
//! A [`Revision`] is one version of a document, identified by `doc_id` plus
//! `rev_id`. Revision IDs have the form `<generation>-<suffix>`, where the
//! generation is a monotonically increasing integer along each branch of the
//! revision tree and the suffix is a digest of the revision content.
//!
//! Revisions are value objects: equality is by `(doc_id, rev_id)` only, so
//! a bodiless stub compares equal to the fully loaded revision it names.
//!
//! [`RevisionList`] is an ordered multiset with the groupings the change
//! feeds and the replicator need (by document, by sequence).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Parse a revision ID into `(generation, suffix)`.
///
/// Returns `None` when the ID does not have the `<int>-<suffix>` shape or
/// the generation is zero.
pub fn parse_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (gen_str, suffix) = rev_id.split_once('-')?;
    let generation: u64 = gen_str.parse().ok()?;
    if generation == 0 || suffix.is_empty() {
        return None;
    }
    Some((generation, suffix))
}

/// Total order on revision IDs: generation first, then suffix bytes.
///
/// This is the deterministic order the store uses to pick a winner among
/// conflicting leaves, and the order `possible_ancestors` reports.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    let pa = parse_rev_id(a);
    let pb = parse_rev_id(b);
    match (pa, pb) {
        (Some((ga, sa)), Some((gb, sb))) => ga.cmp(&gb).then_with(|| sa.cmp(sb)),
        // Malformed IDs sort first so they never win.
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// One version of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// Document identifier.
    pub doc_id: String,
    /// Revision identifier, `<generation>-<suffix>`.
    pub rev_id: String,
    /// Whether this revision is a deletion tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Commit sequence in the owning store, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Document body, when loaded. Includes `_id`/`_rev` when materialized
    /// for the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Revision {
    /// Create a bodiless revision stub.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted: false,
            sequence: None,
            body: None,
        }
    }

    /// Create a revision with a body.
    pub fn with_body(doc_id: impl Into<String>, rev_id: impl Into<String>, body: Value) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted: false,
            sequence: None,
            body: Some(body),
        }
    }

    /// Mark this revision as a deletion tombstone.
    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Attach a sequence number.
    pub fn at_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// The generation component of the revision ID (0 when malformed).
    pub fn generation(&self) -> u64 {
        parse_rev_id(&self.rev_id).map(|(g, _)| g).unwrap_or(0)
    }

    /// The digest suffix of the revision ID.
    pub fn suffix(&self) -> &str {
        parse_rev_id(&self.rev_id).map(|(_, s)| s).unwrap_or("")
    }

    /// The sequence, or 0 when unknown.
    pub fn sequence_or_zero(&self) -> u64 {
        self.sequence.unwrap_or(0)
    }

    /// The body as a JSON object map, when present and an object.
    pub fn body_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.body.as_ref().and_then(|b| b.as_object())
    }

    /// Body with `_id`, `_rev`, and (for tombstones) `_deleted` stamped in.
    pub fn body_for_wire(&self) -> Value {
        let mut map = match &self.body {
            Some(Value::Object(m)) => m.clone(),
            _ => serde_json::Map::new(),
        };
        map.insert("_id".into(), Value::String(self.doc_id.clone()));
        map.insert("_rev".into(), Value::String(self.rev_id.clone()));
        if self.deleted {
            map.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.doc_id == other.doc_id && self.rev_id == other.rev_id
    }
}

impl Eq for Revision {}

impl std::hash::Hash for Revision {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.doc_id.hash(state);
        self.rev_id.hash(state);
    }
}

/// Ordered multiset of revisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionList(pub Vec<Revision>);

impl RevisionList {
    /// Empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, rev: Revision) {
        self.0.push(rev);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.0.iter()
    }

    /// Membership by `(doc_id, rev_id)`.
    pub fn contains(&self, rev: &Revision) -> bool {
        self.0.iter().any(|r| r == rev)
    }

    /// Retain only revisions the predicate accepts.
    pub fn retain(&mut self, f: impl FnMut(&Revision) -> bool) {
        self.0.retain(f);
    }

    /// The highest sequence in the list (0 when empty or unknown).
    pub fn max_sequence(&self) -> u64 {
        self.0.iter().map(Revision::sequence_or_zero).max().unwrap_or(0)
    }

    /// Sort in place by sequence, ascending.
    pub fn sort_by_sequence(&mut self) {
        self.0.sort_by_key(Revision::sequence_or_zero);
    }

    /// Truncate to at most `limit` entries. A zero limit clears the list.
    pub fn truncate(&mut self, limit: usize) {
        self.0.truncate(limit);
    }

    /// Group by document ID, preserving first-seen document order and the
    /// relative order of each document's revisions.
    pub fn grouped_by_doc_id(&self) -> Vec<(String, Vec<&Revision>)> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&Revision>> = HashMap::new();
        for rev in &self.0 {
            if !groups.contains_key(&rev.doc_id) {
                order.push(rev.doc_id.clone());
            }
            groups.entry(rev.doc_id.clone()).or_default().push(rev);
        }
        order
            .into_iter()
            .map(|id| {
                let revs = groups.remove(&id).unwrap_or_default();
                (id, revs)
            })
            .collect()
    }

    /// Deduplicate by `(doc_id, rev_id)`, keeping the first occurrence.
    pub fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.0
            .retain(|r| seen.insert((r.doc_id.clone(), r.rev_id.clone())));
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Revision> for RevisionList {
    fn from_iter<T: IntoIterator<Item = Revision>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Revision>> for RevisionList {
    fn from(v: Vec<Revision>) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rev_id() {
        assert_eq!(parse_rev_id("1-abc"), Some((1, "abc")));
        assert_eq!(parse_rev_id("42-deadbeef"), Some((42, "deadbeef")));
        assert_eq!(parse_rev_id("0-abc"), None);
        assert_eq!(parse_rev_id("abc"), None);
        assert_eq!(parse_rev_id("x-abc"), None);
        assert_eq!(parse_rev_id("3-"), None);
        assert_eq!(parse_rev_id(""), None);
    }

    #[test]
    fn test_compare_rev_ids_generation_dominates() {
        assert_eq!(compare_rev_ids("2-aaa", "1-zzz"), Ordering::Greater);
        assert_eq!(compare_rev_ids("1-zzz", "10-aaa"), Ordering::Less);
    }

    #[test]
    fn test_compare_rev_ids_suffix_breaks_ties() {
        assert_eq!(compare_rev_ids("3-abc", "3-abd"), Ordering::Less);
        assert_eq!(compare_rev_ids("3-abc", "3-abc"), Ordering::Equal);
    }

    #[test]
    fn test_malformed_rev_ids_sort_first() {
        assert_eq!(compare_rev_ids("1-a", "garbage"), Ordering::Greater);
        assert_eq!(compare_rev_ids("garbage", "1-a"), Ordering::Less);
    }

    #[test]
    fn test_equality_ignores_body_and_sequence() {
        let stub = Revision::new("doc", "1-abc");
        let full = Revision::with_body("doc", "1-abc", json!({"x": 1})).at_sequence(7);
        assert_eq!(stub, full);

        let other = Revision::new("doc", "2-def");
        assert_ne!(stub, other);
    }

    #[test]
    fn test_generation() {
        assert_eq!(Revision::new("d", "7-ffff").generation(), 7);
        assert_eq!(Revision::new("d", "bogus").generation(), 0);
    }

    #[test]
    fn test_body_for_wire_stamps_identity() {
        let rev = Revision::with_body("doc1", "2-bb", json!({"k": "v"}));
        let wire = rev.body_for_wire();
        assert_eq!(wire["_id"], "doc1");
        assert_eq!(wire["_rev"], "2-bb");
        assert_eq!(wire["k"], "v");
        assert!(wire.get("_deleted").is_none());

        let tomb = Revision::new("doc1", "3-cc").deleted(true);
        assert_eq!(tomb.body_for_wire()["_deleted"], true);
    }

    #[test]
    fn test_list_sort_and_max_sequence() {
        let mut list = RevisionList::from(vec![
            Revision::new("a", "1-x").at_sequence(3),
            Revision::new("b", "1-y").at_sequence(1),
            Revision::new("c", "1-z").at_sequence(2),
        ]);
        assert_eq!(list.max_sequence(), 3);
        list.sort_by_sequence();
        let seqs: Vec<u64> = list.iter().map(Revision::sequence_or_zero).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_grouped_by_doc_id_preserves_order() {
        let list = RevisionList::from(vec![
            Revision::new("a", "1-x"),
            Revision::new("b", "1-y"),
            Revision::new("a", "2-z"),
        ]);
        let groups = list.grouped_by_doc_id();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "b");
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut list = RevisionList::from(vec![
            Revision::new("a", "1-x").at_sequence(1),
            Revision::new("a", "1-x").at_sequence(9),
            Revision::new("a", "2-y"),
        ]);
        list.dedup();
        assert_eq!(list.len(), 2);
        assert_eq!(list.0[0].sequence, Some(1));
    }
}
