//! Property-based tests for the pure kernels: revision IDs, canonical
//! JSON, checkpoint identity, batching, and JSON collation.

use davenport::batcher::Batcher;
use davenport::checkpoint::{canonical_json, checkpoint_id};
use davenport::memory::collate_json;
use davenport::revision::{compare_rev_ids, parse_rev_id, Revision, RevisionList};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::time::Duration;

fn arb_json(depth: u32) -> BoxedStrategy<Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z0-9]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(depth, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
    .boxed()
}

fn arb_rev_id() -> impl Strategy<Value = String> {
    (1u64..1000, "[a-f0-9]{4,12}").prop_map(|(generation, suffix)| {
        format!("{}-{}", generation, suffix)
    })
}

proptest! {
    #[test]
    fn prop_rev_id_parse_round_trip(rev_id in arb_rev_id()) {
        let (generation, suffix) = parse_rev_id(&rev_id).expect("well-formed");
        prop_assert_eq!(format!("{}-{}", generation, suffix), rev_id);
    }

    #[test]
    fn prop_rev_id_order_is_total_and_antisymmetric(
        a in arb_rev_id(),
        b in arb_rev_id(),
    ) {
        let ab = compare_rev_ids(&a, &b);
        let ba = compare_rev_ids(&b, &a);
        prop_assert_eq!(ab, ba.reverse());
        if a == b {
            prop_assert_eq!(ab, Ordering::Equal);
        }
    }

    #[test]
    fn prop_rev_id_order_generation_dominates(
        ga in 1u64..1000, gb in 1u64..1000,
        sa in "[a-f0-9]{4}", sb in "[a-f0-9]{4}",
    ) {
        let a = format!("{}-{}", ga, sa);
        let b = format!("{}-{}", gb, sb);
        if ga != gb {
            prop_assert_eq!(compare_rev_ids(&a, &b), ga.cmp(&gb));
        }
    }

    #[test]
    fn prop_canonical_json_is_deterministic_and_compact(value in arb_json(3)) {
        let once = canonical_json(&value);
        let twice = canonical_json(&serde_json::from_str(&once).unwrap());
        prop_assert_eq!(&once, &twice);
        // Canonical form never contains whitespace outside strings.
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        prop_assert_eq!(canonical_json(&reparsed), once);
    }

    #[test]
    fn prop_checkpoint_id_pure_and_sensitive(
        uuid in "[a-f0-9]{16}",
        url in "http://[a-z]{3,8}/[a-z]{1,8}",
        push in any::<bool>(),
    ) {
        let id = checkpoint_id(&uuid, &url, push, None, None);
        prop_assert_eq!(id.len(), 40);
        prop_assert_eq!(&checkpoint_id(&uuid, &url, push, None, None), &id);
        // Flipping the direction always changes the identity.
        prop_assert_ne!(checkpoint_id(&uuid, &url, !push, None, None), id);
    }

    #[test]
    fn prop_checkpoint_id_ignores_param_ordering(
        uuid in "[a-f0-9]{8}",
        keys in prop::collection::btree_set("[a-z]{1,5}", 1..5),
    ) {
        let entries: Vec<(String, Value)> = keys
            .iter()
            .enumerate()
            .map(|(index, key)| (key.clone(), json!(index)))
            .collect();
        let forward: serde_json::Map<String, Value> = entries.iter().cloned().collect();
        let reversed: serde_json::Map<String, Value> =
            entries.iter().rev().cloned().collect();
        let a = checkpoint_id(&uuid, "http://p/db", true, Some("f"), Some(&Value::Object(forward)));
        let b = checkpoint_id(&uuid, "http://p/db", true, Some("f"), Some(&Value::Object(reversed)));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_batcher_preserves_order_and_count(items in prop::collection::vec(any::<u32>(), 0..200)) {
        let mut batcher = Batcher::new(50, Duration::from_millis(500));
        batcher.queue_all(items.iter().copied());
        prop_assert_eq!(batcher.count(), items.len());
        let drained = batcher.take();
        prop_assert_eq!(drained, items);
        prop_assert_eq!(batcher.count(), 0);
    }

    #[test]
    fn prop_collate_json_is_consistent(a in arb_json(2), b in arb_json(2)) {
        let ab = collate_json(&a, &b);
        let ba = collate_json(&b, &a);
        prop_assert_eq!(ab, ba.reverse());
        prop_assert_eq!(collate_json(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prop_revision_list_dedup_is_idempotent(
        ids in prop::collection::vec(("[ab]", arb_rev_id()), 0..30),
    ) {
        let mut list: RevisionList = ids
            .iter()
            .map(|(doc, rev)| Revision::new(doc.clone(), rev.clone()))
            .collect();
        list.dedup();
        let after_first = list.clone();
        list.dedup();
        prop_assert_eq!(&list, &after_first);
        // No duplicates remain.
        for (index, rev) in list.iter().enumerate() {
            for other in list.iter().skip(index + 1) {
                prop_assert!(rev != other);
            }
        }
    }

    #[test]
    fn prop_grouping_preserves_membership(
        ids in prop::collection::vec(("[abc]", arb_rev_id()), 0..30),
    ) {
        let list: RevisionList = ids
            .iter()
            .map(|(doc, rev)| Revision::new(doc.clone(), rev.clone()))
            .collect();
        let groups = list.grouped_by_doc_id();
        let regrouped: usize = groups.iter().map(|(_, revs)| revs.len()).sum();
        prop_assert_eq!(regrouped, list.len());
        for (doc_id, revs) in &groups {
            prop_assert!(revs.iter().all(|r| &r.doc_id == doc_id));
        }
    }
}
