use std::collections::BTreeSet;

use onemcp::tag_query::{TagQuery, parse};

fn subsets(universe: &[&str]) -> Vec<BTreeSet<String>> {
    let mut all = Vec::new();
    for mask in 0..(1u32 << universe.len()) {
        let mut set = BTreeSet::new();
        for (i, tag) in universe.iter().enumerate() {
            if mask & (1 << i) != 0 {
                set.insert(tag.to_string());
            }
        }
        all.push(set);
    }
    all
}

/// Reference interpreter: the standard boolean semantics the engine must
/// agree with on every input.
fn reference_eval(query: &TagQuery, tags: &BTreeSet<String>) -> bool {
    match query {
        TagQuery::Tag(t) => tags.contains(t),
        TagQuery::Not(inner) => !reference_eval(inner, tags),
        TagQuery::And(items) => items.iter().all(|q| reference_eval(q, tags)),
        TagQuery::Or(items) => items.iter().any(|q| reference_eval(q, tags)),
    }
}

const CASES: &[&str] = &[
    "a",
    "not a",
    "a and b",
    "a or b",
    "a and b or c",
    "a or b and c",
    "not (a or b)",
    "not a and not b",
    "a and (b or c) not d",
    "(a or b) and (c or d)",
    "a,b,-c",
    "a && !b || c",
    "not not a",
];

#[test]
fn evaluation_matches_reference_semantics_on_every_subset() {
    let universe = ["a", "b", "c", "d"];
    for case in CASES {
        let query = parse(case).unwrap();
        for tags in subsets(&universe) {
            assert_eq!(
                query.matches(&tags),
                reference_eval(&query, &tags),
                "case {case:?} on {tags:?}"
            );
        }
    }
}

#[test]
fn text_and_json_round_trips_preserve_every_case() {
    for case in CASES {
        let query = parse(case).unwrap();

        let rendered = query.to_string();
        assert_eq!(parse(&rendered).unwrap(), query, "text round trip of {case:?}");
        assert_eq!(
            parse(&rendered).unwrap().to_string(),
            rendered,
            "canonical form must be stable for {case:?}"
        );

        let json = query.to_json();
        assert_eq!(
            TagQuery::from_json(&json).unwrap(),
            query,
            "json round trip of {case:?}"
        );

        // rendered text and json must stay semantically identical
        let reparsed = parse(&rendered).unwrap();
        for tags in subsets(&["a", "b", "c", "d"]) {
            assert_eq!(query.matches(&tags), reparsed.matches(&tags));
        }
    }
}

#[test]
fn empty_combinators_follow_boolean_identities() {
    let empty = BTreeSet::new();
    assert!(TagQuery::And(vec![]).matches(&empty));
    assert!(!TagQuery::Or(vec![]).matches(&empty));

    let and_json = serde_json::json!({ "$and": [] });
    assert!(TagQuery::from_json(&and_json).unwrap().matches(&empty));
    let or_json = serde_json::json!({ "$or": [] });
    assert!(!TagQuery::from_json(&or_json).unwrap().matches(&empty));
}
