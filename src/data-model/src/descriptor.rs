// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Descriptor types carried through store APIs.

use std::sync::Arc;

use crate::flag::FeatureFlag;
use crate::kind::DataKind;
use crate::segment::Segment;

/// An item payload, tagged by kind.
///
/// The `Opaque` variant carries items of kinds this build does not know how
/// to interpret; stores keep them intact so that newer data kinds survive a
/// round trip through an older process.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
    Opaque(serde_json::Value),
}

impl StoreItem {
    /// The item's own version number.
    pub fn version(&self) -> i64 {
        match self {
            StoreItem::Flag(f) => f.version,
            StoreItem::Segment(s) => s.version,
            StoreItem::Opaque(v) => v.get("version").and_then(serde_json::Value::as_i64).unwrap_or(0),
        }
    }

    /// The item's key, if it carries one.
    pub fn key(&self) -> Option<&str> {
        match self {
            StoreItem::Flag(f) => Some(&f.key),
            StoreItem::Segment(s) => Some(&s.key),
            StoreItem::Opaque(v) => v.get("key").and_then(serde_json::Value::as_str),
        }
    }
}

/// A versioned item slot: a live item, a tombstone (`item == None` with a
/// positive version), or the not-found sentinel ([`ItemDescriptor::NOT_FOUND`]).
///
/// Items are shared via `Arc` so that store reads on the evaluation hot path
/// clone a pointer, not a flag.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: i64,
    pub item: Option<Arc<StoreItem>>,
}

impl ItemDescriptor {
    /// The sentinel returned by `get` for keys that have never existed.
    ///
    /// Distinct from a tombstone: tombstones carry the version of the
    /// deletion so that stale writes lose to them.
    pub const NOT_FOUND: ItemDescriptor = ItemDescriptor {
        version: -1,
        item: None,
    };

    /// Wraps a live item, taking the version from the item itself.
    pub fn new(item: StoreItem) -> ItemDescriptor {
        ItemDescriptor {
            version: item.version(),
            item: Some(Arc::new(item)),
        }
    }

    /// A deletion placeholder at the given version.
    pub fn tombstone(version: i64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.version == -1 && self.item.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_none() && self.version != -1
    }
}

/// An [`ItemDescriptor`] paired with its key, for bulk APIs.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedItemDescriptor {
    pub key: String,
    pub item: ItemDescriptor,
}

/// All items of one kind; a full initialization payload is a `Vec<Collection>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Collection {
    pub kind: DataKind,
    pub items: Vec<KeyedItemDescriptor>,
}

/// The persistent-store representation of an item: version and deletedness
/// out-of-band, payload as opaque bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedItemDescriptor {
    pub version: i64,
    pub deleted: bool,
    pub serialized: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyedSerializedItemDescriptor {
    pub key: String,
    pub item: SerializedItemDescriptor,
}

/// The serialized form of a [`Collection`], as handed to persistent stores.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedCollection {
    pub kind: DataKind,
    pub items: Vec<KeyedSerializedItemDescriptor>,
}
