// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dependency ordering of full data sets.
//!
//! Stores that write an initialization payload item by item (persistent
//! stores in particular) must never write an item before the items it
//! depends on, or a concurrently evaluating client could see a flag whose
//! prerequisite does not exist yet.

use std::collections::BTreeMap;

use beacon_data_model::{
    Collection, DataKind, FEATURES, ItemDescriptor, KeyedItemDescriptor, SEGMENTS, StoreItem,
};

/// Orders a full data set so dependencies precede dependents.
///
/// Collections are ordered segments first, then features, then unknown kinds
/// in arrival order. Within the two known kinds, items are emitted in
/// post-order over their same-kind dependencies, so every flag appears after
/// its prerequisites and every segment after the segments its rules
/// reference. Reference cycles are tolerated; cycle members come out in an
/// arbitrary but deterministic order.
pub(crate) fn sort_collections(all_data: Vec<Collection>) -> Vec<Collection> {
    let mut collections = all_data;
    collections.sort_by_key(|c| kind_priority(c.kind));
    for collection in &mut collections {
        if collection.kind == FEATURES || collection.kind == SEGMENTS {
            let items = std::mem::take(&mut collection.items);
            collection.items = sort_items(collection.kind, items);
        }
    }
    collections
}

fn kind_priority(kind: DataKind) -> u8 {
    if kind == SEGMENTS {
        0
    } else if kind == FEATURES {
        1
    } else {
        2
    }
}

fn sort_items(kind: DataKind, items: Vec<KeyedItemDescriptor>) -> Vec<KeyedItemDescriptor> {
    let capacity = items.len();
    let mut remaining: BTreeMap<String, KeyedItemDescriptor> = items
        .into_iter()
        .map(|keyed| (keyed.key.clone(), keyed))
        .collect();
    let mut out = Vec::with_capacity(capacity);
    while let Some(key) = remaining.keys().next().cloned() {
        visit(kind, &mut remaining, &mut out, &key);
    }
    out
}

fn visit(
    kind: DataKind,
    remaining: &mut BTreeMap<String, KeyedItemDescriptor>,
    out: &mut Vec<KeyedItemDescriptor>,
    key: &str,
) {
    // Removing before recursing doubles as the cycle guard.
    let Some(keyed) = remaining.remove(key) else {
        return;
    };
    for dep in same_kind_dependency_keys(kind, &keyed.item) {
        visit(kind, remaining, out, &dep);
    }
    out.push(keyed);
}

fn same_kind_dependency_keys(kind: DataKind, item: &ItemDescriptor) -> Vec<String> {
    match item.item.as_deref() {
        Some(StoreItem::Flag(flag)) if kind == FEATURES => {
            flag.prerequisite_keys().map(String::from).collect()
        }
        Some(StoreItem::Segment(segment)) if kind == SEGMENTS => {
            segment.referenced_segment_keys().map(String::from).collect()
        }
        _ => Vec::new(),
    }
}
