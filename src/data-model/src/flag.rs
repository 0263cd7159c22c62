// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The feature flag data model.

use serde::{Deserialize, Serialize};

/// A versioned feature flag configuration.
///
/// Unknown JSON properties are ignored on the way in so that older builds can
/// ingest payloads produced by newer service versions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub on: bool,
    /// Flags that must evaluate to a specific variation before this flag's
    /// own targeting applies.
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub variations: Vec<serde_json::Value>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

impl FeatureFlag {
    /// The keys of every flag this flag lists as a prerequisite.
    pub fn prerequisite_keys(&self) -> impl Iterator<Item = &str> {
        self.prerequisites.iter().map(|p| p.key.as_str())
    }

    /// The keys of every segment referenced by a `segmentMatch` clause in any
    /// of this flag's rules.
    pub fn referenced_segment_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|r| r.clauses.iter())
            .flat_map(Clause::segment_match_keys)
    }
}

/// A reference from a flag to another flag that must evaluate to the given
/// variation first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    #[serde(default)]
    pub variation: usize,
}

/// Individual user keys that are pinned to a variation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub variation: usize,
}

/// A targeting rule: all clauses must match for the rule to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// Either a fixed variation index or a percentage rollout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    #[serde(default)]
    pub weight: i32,
}

/// A single condition within a rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub negate: bool,
}

impl Clause {
    /// The segment keys named by this clause, if it is a `segmentMatch`
    /// clause. Non-string values are skipped.
    pub fn segment_match_keys(&self) -> impl Iterator<Item = &str> {
        let values: &[serde_json::Value] = match self.op {
            Operator::SegmentMatch => &self.values,
            _ => &[],
        };
        values.iter().filter_map(|v| v.as_str())
    }
}

/// The matching operator of a [`Clause`].
///
/// Operators introduced by newer service versions deserialize as
/// [`Operator::Unknown`]; clauses using them simply never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_match_clause(keys: &[&str]) -> Clause {
        Clause {
            attribute: String::new(),
            op: Operator::SegmentMatch,
            values: keys.iter().map(|k| serde_json::json!(k)).collect(),
            negate: false,
        }
    }

    #[test]
    fn parse_ignores_unknown_properties() {
        let flag: FeatureFlag = serde_json::from_str(
            r#"{
                "key": "flag-a",
                "version": 3,
                "on": true,
                "someFutureProperty": {"nested": [1, 2, 3]},
                "variations": [true, false]
            }"#,
        )
        .unwrap();
        assert_eq!(flag.key, "flag-a");
        assert_eq!(flag.version, 3);
        assert_eq!(flag.variations.len(), 2);
    }

    #[test]
    fn parse_unknown_operator() {
        let clause: Clause =
            serde_json::from_str(r#"{"attribute": "email", "op": "quantumMatch", "values": []}"#)
                .unwrap();
        assert_eq!(clause.op, Operator::Unknown);
    }

    #[test]
    fn segment_references_from_rules() {
        let flag = FeatureFlag {
            key: "f".into(),
            version: 1,
            on: true,
            prerequisites: vec![
                Prerequisite {
                    key: "p1".into(),
                    variation: 0,
                },
                Prerequisite {
                    key: "p2".into(),
                    variation: 1,
                },
            ],
            targets: vec![],
            rules: vec![
                FlagRule {
                    id: None,
                    clauses: vec![segment_match_clause(&["s1", "s2"])],
                    variation_or_rollout: VariationOrRollout::default(),
                    track_events: false,
                },
                FlagRule {
                    id: None,
                    clauses: vec![
                        Clause {
                            attribute: "country".into(),
                            op: Operator::In,
                            values: vec![serde_json::json!("us")],
                            negate: false,
                        },
                        segment_match_clause(&["s3"]),
                    ],
                    variation_or_rollout: VariationOrRollout::default(),
                    track_events: false,
                },
            ],
            fallthrough: VariationOrRollout::default(),
            off_variation: None,
            variations: vec![],
            salt: String::new(),
            track_events: false,
            debug_events_until_date: None,
        };
        let prereqs: Vec<_> = flag.prerequisite_keys().collect();
        assert_eq!(prereqs, vec!["p1", "p2"]);
        let segments: Vec<_> = flag.referenced_segment_keys().collect();
        assert_eq!(segments, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn roundtrip() {
        let flag: FeatureFlag = serde_json::from_str(
            r#"{
                "key": "flag-b",
                "version": 9,
                "on": true,
                "prerequisites": [{"key": "other", "variation": 1}],
                "targets": [{"values": ["user-1"], "variation": 0}],
                "rules": [{
                    "id": "rule-1",
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["seg-1"]}],
                    "variation": 1
                }],
                "fallthrough": {"rollout": {"variations": [{"variation": 0, "weight": 100000}]}},
                "offVariation": 1,
                "variations": [true, false],
                "salt": "abcdef"
            }"#,
        )
        .unwrap();
        let bytes = serde_json::to_vec(&flag).unwrap();
        let reparsed: FeatureFlag = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(flag, reparsed);
    }
}
