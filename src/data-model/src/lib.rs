// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Beacon SDK data model.
//!
//! Everything the data-synchronization machinery moves around is expressed in
//! terms of this crate: versioned [`FeatureFlag`]s and [`Segment`]s, the
//! [`DataKind`] descriptors that give stores a uniform way to (de)serialize
//! items of either kind (or of kinds this build has never heard of), and the
//! descriptor types that carry items, tombstones, and the not-found sentinel
//! through store APIs.
//!
//! The evaluation engine consumes these types but lives elsewhere; nothing in
//! this crate knows how to evaluate a flag.

mod descriptor;
mod flag;
mod kind;
mod segment;

pub use descriptor::{
    Collection, ItemDescriptor, KeyedItemDescriptor, KeyedSerializedItemDescriptor,
    SerializedCollection, SerializedItemDescriptor, StoreItem,
};
pub use flag::{
    Clause, FeatureFlag, FlagRule, Operator, Prerequisite, Rollout, Target, VariationOrRollout,
    WeightedVariation,
};
pub use kind::{ALL_DATA_KINDS, DataKind, FEATURES, ModelError, SEGMENTS};
pub use segment::{Segment, SegmentRule};
