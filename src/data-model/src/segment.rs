// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The user segment data model.

use serde::{Deserialize, Serialize};

use crate::flag::Clause;

/// A versioned named set of users.
///
/// Segments may reference other segments through `segmentMatch` clauses in
/// their rules, which is why segment updates can ripple out to flags that
/// never mention the updated segment directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default)]
    pub unbounded: bool,
}

impl Segment {
    /// The keys of every segment referenced by a `segmentMatch` clause in any
    /// of this segment's rules.
    pub fn referenced_segment_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|r| r.clauses.iter())
            .flat_map(Clause::segment_match_keys)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Operator;

    #[test]
    fn roundtrip() {
        let segment: Segment = serde_json::from_str(
            r#"{
                "key": "seg-a",
                "version": 2,
                "included": ["user-1"],
                "excluded": [],
                "rules": [{
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["seg-b"]}],
                    "weight": 50000
                }],
                "salt": "xyz"
            }"#,
        )
        .unwrap();
        let bytes = serde_json::to_vec(&segment).unwrap();
        let reparsed: Segment = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(segment, reparsed);
        assert_eq!(segment.rules[0].clauses[0].op, Operator::SegmentMatch);
        let refs: Vec<_> = segment.referenced_segment_keys().collect();
        assert_eq!(refs, vec!["seg-b"]);
    }
}
