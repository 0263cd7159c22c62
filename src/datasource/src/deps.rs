// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The flag/segment dependency graph.
//!
//! Flags reference prerequisite flags and segments; segments reference other
//! segments. The tracker maintains both edge directions so that when any
//! item changes, the set of flags whose evaluation could change is the
//! transitive closure over the reverse edges.

use std::collections::{BTreeMap, BTreeSet};

use beacon_data_model::{DataKind, FEATURES, ItemDescriptor, SEGMENTS, StoreItem};

/// A graph vertex: one item of one kind.
pub(crate) type Vertex = (DataKind, String);

#[derive(Debug, Default)]
pub(crate) struct DependencyTracker {
    /// vertex → items it references.
    from: BTreeMap<Vertex, BTreeSet<Vertex>>,
    /// vertex → items that reference it.
    to: BTreeMap<Vertex, BTreeSet<Vertex>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    /// Re-derives the outgoing edges of `(kind, key)` from `item` and fixes
    /// up the reverse edges on both the old and new dependency sets.
    pub fn update_dependencies_from(&mut self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let vertex: Vertex = (kind, key.to_string());
        let new_deps = compute_dependencies(kind, item);

        if let Some(old_deps) = self.from.get(&vertex) {
            for dep in old_deps {
                if let Some(dependents) = self.to.get_mut(dep) {
                    dependents.remove(&vertex);
                }
            }
        }
        for dep in &new_deps {
            self.to
                .entry(dep.clone())
                .or_default()
                .insert(vertex.clone());
        }
        self.from.insert(vertex, new_deps);
    }

    /// Adds `start` and everything that transitively depends on it to `out`.
    /// The output set doubles as the visited guard, so reference cycles
    /// terminate.
    pub fn add_affected(&self, out: &mut BTreeSet<Vertex>, start: &Vertex) {
        if !out.insert(start.clone()) {
            return;
        }
        if let Some(dependents) = self.to.get(start) {
            for dependent in dependents {
                self.add_affected(out, dependent);
            }
        }
    }

    /// Drops both graphs; called before rebuilding on a full data set.
    pub fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
    }
}

/// The items `item` references: for a flag, its prerequisite flags and any
/// segments named in `segmentMatch` clauses; for a segment, any segments its
/// rules reference. Tombstones and unknown kinds contribute nothing.
fn compute_dependencies(kind: DataKind, item: &ItemDescriptor) -> BTreeSet<Vertex> {
    let mut deps = BTreeSet::new();
    match item.item.as_deref() {
        Some(StoreItem::Flag(flag)) if kind == FEATURES => {
            for prereq in flag.prerequisite_keys() {
                deps.insert((FEATURES, prereq.to_string()));
            }
            for segment in flag.referenced_segment_keys() {
                deps.insert((SEGMENTS, segment.to_string()));
            }
        }
        Some(StoreItem::Segment(segment)) if kind == SEGMENTS => {
            for other in segment.referenced_segment_keys() {
                deps.insert((SEGMENTS, other.to_string()));
            }
        }
        _ => {}
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{flag_with_deps, segment_with_refs};

    fn vertex(kind: DataKind, key: &str) -> Vertex {
        (kind, key.to_string())
    }

    fn affected(tracker: &DependencyTracker, kind: DataKind, key: &str) -> BTreeSet<Vertex> {
        let mut out = BTreeSet::new();
        tracker.add_affected(&mut out, &vertex(kind, key));
        out
    }

    #[test]
    fn affected_set_is_the_reverse_transitive_closure() {
        let mut tracker = DependencyTracker::new();
        // a → {b}, b → {c}; updating c affects b and a.
        tracker.update_dependencies_from(FEATURES, "a", &flag_with_deps("a", 1, &["b"], &[]));
        tracker.update_dependencies_from(FEATURES, "b", &flag_with_deps("b", 1, &["c"], &[]));
        tracker.update_dependencies_from(FEATURES, "c", &flag_with_deps("c", 1, &[], &[]));

        assert_eq!(
            affected(&tracker, FEATURES, "c"),
            [
                vertex(FEATURES, "a"),
                vertex(FEATURES, "b"),
                vertex(FEATURES, "c")
            ]
            .into()
        );
        assert_eq!(
            affected(&tracker, FEATURES, "a"),
            [vertex(FEATURES, "a")].into()
        );
    }

    #[test]
    fn segment_edges_reach_flags() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(FEATURES, "x", &flag_with_deps("x", 1, &[], &["s"]));
        tracker.update_dependencies_from(SEGMENTS, "s", &segment_with_refs("s", 1, &["inner"]));
        tracker.update_dependencies_from(SEGMENTS, "inner", &segment_with_refs("inner", 1, &[]));

        assert_eq!(
            affected(&tracker, SEGMENTS, "inner"),
            [
                vertex(SEGMENTS, "inner"),
                vertex(SEGMENTS, "s"),
                vertex(FEATURES, "x")
            ]
            .into()
        );
    }

    #[test]
    fn updating_an_item_replaces_its_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(FEATURES, "a", &flag_with_deps("a", 1, &["b"], &[]));
        tracker.update_dependencies_from(FEATURES, "a", &flag_with_deps("a", 2, &["c"], &[]));

        assert_eq!(
            affected(&tracker, FEATURES, "b"),
            [vertex(FEATURES, "b")].into()
        );
        assert_eq!(
            affected(&tracker, FEATURES, "c"),
            [vertex(FEATURES, "c"), vertex(FEATURES, "a")].into()
        );
    }

    #[test]
    fn tombstones_contribute_no_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(FEATURES, "a", &flag_with_deps("a", 1, &["b"], &[]));
        tracker.update_dependencies_from(FEATURES, "a", &ItemDescriptor::tombstone(2));

        assert_eq!(
            affected(&tracker, FEATURES, "b"),
            [vertex(FEATURES, "b")].into()
        );
    }

    #[test]
    fn cycles_terminate() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(SEGMENTS, "s1", &segment_with_refs("s1", 1, &["s2"]));
        tracker.update_dependencies_from(SEGMENTS, "s2", &segment_with_refs("s2", 1, &["s1"]));

        assert_eq!(
            affected(&tracker, SEGMENTS, "s1"),
            [vertex(SEGMENTS, "s1"), vertex(SEGMENTS, "s2")].into()
        );
    }

    #[test]
    fn reset_empties_the_graph() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(FEATURES, "a", &flag_with_deps("a", 1, &["b"], &[]));
        tracker.reset();
        assert_eq!(
            affected(&tracker, FEATURES, "b"),
            [vertex(FEATURES, "b")].into()
        );
    }
}
