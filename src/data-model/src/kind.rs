// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data kind descriptors.
//!
//! A [`DataKind`] identifies a namespace of versioned items and knows how to
//! move items of that namespace across the byte boundary: serialize them for
//! a persistent store, parse them back, and manufacture the serialized
//! placeholder for a deletion. The two kinds this build interprets are
//! [`FEATURES`] and [`SEGMENTS`]; any other kind round-trips opaquely.

use serde_json::Value;
use thiserror::Error;

use crate::descriptor::{ItemDescriptor, SerializedItemDescriptor, StoreItem};

/// Feature flag definitions.
pub const FEATURES: DataKind = DataKind::new("features");

/// User segment definitions.
pub const SEGMENTS: DataKind = DataKind::new("segments");

/// Every kind this build interprets, in initialization order: segments come
/// first because flags depend on them.
pub const ALL_DATA_KINDS: [DataKind; 2] = [SEGMENTS, FEATURES];

/// Identifies a namespace of versioned items.
///
/// Kinds are compared by name, so a kind constructed by an extension with
/// [`DataKind::new`] interoperates with the built-in constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataKind {
    name: &'static str,
}

impl DataKind {
    pub const fn new(name: &'static str) -> DataKind {
        DataKind { name }
    }

    /// The stable wire name of this kind, e.g. `"features"`.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Serializes a descriptor for handoff to a persistent store. Tombstones
    /// serialize through [`DataKind::deleted_item`].
    pub fn serialize_item(
        &self,
        key: &str,
        descriptor: &ItemDescriptor,
    ) -> Result<SerializedItemDescriptor, ModelError> {
        let Some(item) = &descriptor.item else {
            return Ok(self.deleted_item(key, descriptor.version));
        };
        let serialized = match &**item {
            StoreItem::Flag(f) => serde_json::to_vec(f),
            StoreItem::Segment(s) => serde_json::to_vec(s),
            StoreItem::Opaque(v) => serde_json::to_vec(v),
        }
        .map_err(|source| ModelError::Serialize {
            kind: self.name,
            source,
        })?;
        Ok(SerializedItemDescriptor {
            version: descriptor.version,
            deleted: false,
            serialized,
        })
    }

    /// The serialized placeholder for a deleted item. The payload is
    /// non-empty and carries the key and version so that stores which persist
    /// only the bytes can still defeat stale writes after a round trip.
    pub fn deleted_item(&self, key: &str, version: i64) -> SerializedItemDescriptor {
        let serialized = serde_json::json!({
            "key": key,
            "version": version,
            "deleted": true,
        })
        .to_string()
        .into_bytes();
        SerializedItemDescriptor {
            version,
            deleted: true,
            serialized,
        }
    }

    /// Parses raw item bytes, as received in a stream `patch` or read back
    /// from a persistent store. A payload with `"deleted": true` parses to a
    /// tombstone.
    pub fn deserialize_item(&self, data: &[u8]) -> Result<ItemDescriptor, ModelError> {
        let value: Value = serde_json::from_slice(data).map_err(|source| ModelError::Malformed {
            kind: self.name,
            source,
        })?;
        let version = value.get("version").and_then(Value::as_i64).unwrap_or(0);
        if value.get("deleted").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(ItemDescriptor::tombstone(version));
        }
        let item = match self.name {
            "features" => StoreItem::Flag(serde_json::from_value(value).map_err(|source| {
                ModelError::Malformed {
                    kind: self.name,
                    source,
                }
            })?),
            "segments" => StoreItem::Segment(serde_json::from_value(value).map_err(|source| {
                ModelError::Malformed {
                    kind: self.name,
                    source,
                }
            })?),
            _ => StoreItem::Opaque(value),
        };
        Ok(ItemDescriptor::new(item))
    }

    /// Restores a descriptor from a persistent-store read.
    ///
    /// The version and deleted flag reported by the store are authoritative
    /// even when the serialized bytes disagree; some stores carry both
    /// out-of-band.
    pub fn deserialize_from_store(
        &self,
        serialized: &SerializedItemDescriptor,
    ) -> Result<ItemDescriptor, ModelError> {
        if serialized.deleted || serialized.serialized.is_empty() {
            return Ok(ItemDescriptor::tombstone(serialized.version));
        }
        let mut descriptor = self.deserialize_item(&serialized.serialized)?;
        descriptor.version = serialized.version;
        Ok(descriptor)
    }
}

/// Errors moving items across the byte boundary.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("malformed {kind} item: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize {kind} item: {source}")]
    Serialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
