// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire payloads of the configuration service.
//!
//! Both transports speak the same JSON shapes: the polling endpoint returns
//! a bare [`AllData`] object, and the stream wraps the same object in a
//! `put` event, with incremental `patch`/`delete` events addressing single
//! items by path (`/flags/{key}` or `/segments/{key}`). The map-of-maps
//! shape exists only here; everything downstream speaks `Vec<Collection>`.

use std::collections::BTreeMap;

use beacon_data_model::{
    Collection, DataKind, FEATURES, FeatureFlag, ItemDescriptor, KeyedItemDescriptor, SEGMENTS,
    Segment, StoreItem,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum EventError {
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event payload is missing required property {0:?}")]
    MissingProperty(&'static str),
    #[error(transparent)]
    Model(#[from] beacon_data_model::ModelError),
}

/// The full-snapshot shape: all flags and all segments, keyed by item key.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AllData {
    #[serde(default)]
    flags: BTreeMap<String, FeatureFlag>,
    #[serde(default)]
    segments: BTreeMap<String, Segment>,
}

#[derive(Debug, Deserialize)]
struct PutData {
    // `path` is also present on the wire but carries no information for the
    // top-level stream.
    data: AllData,
}

/// Converts the wire shape into collections, segments first so that a store
/// initialized in order always has an item's dependencies before the item.
fn collections_from(all_data: AllData) -> Vec<Collection> {
    vec![
        Collection {
            kind: SEGMENTS,
            items: all_data
                .segments
                .into_iter()
                .map(|(key, segment)| KeyedItemDescriptor {
                    key,
                    item: ItemDescriptor::new(StoreItem::Segment(segment)),
                })
                .collect(),
        },
        Collection {
            kind: FEATURES,
            items: all_data
                .flags
                .into_iter()
                .map(|(key, flag)| KeyedItemDescriptor {
                    key,
                    item: ItemDescriptor::new(StoreItem::Flag(flag)),
                })
                .collect(),
        },
    ]
}

/// Parses a polling response body.
pub(crate) fn parse_all_data(body: &str) -> Result<Vec<Collection>, EventError> {
    Ok(collections_from(serde_json::from_str::<AllData>(body)?))
}

/// Parses a `put` event payload.
pub(crate) fn parse_put(data: &str) -> Result<Vec<Collection>, EventError> {
    Ok(collections_from(serde_json::from_str::<PutData>(data)?.data))
}

/// Parses a `patch` event payload into `(kind, key, item)`.
///
/// Returns `Ok(None)` for paths addressing namespaces this build does not
/// recognize; those patches are ignored without disturbing the stream. The
/// payload is buffered into a single JSON value and its fields are read by
/// name, so `data` arriving before `path` parses fine; the kind derived
/// from `path` is applied to `data` afterwards.
pub(crate) fn parse_patch(
    data: &str,
) -> Result<Option<(DataKind, String, ItemDescriptor)>, EventError> {
    let value: Value = serde_json::from_str(data)?;
    let path = value
        .get("path")
        .and_then(Value::as_str)
        .ok_or(EventError::MissingProperty("path"))?;
    let Some((kind, key)) = parse_path(path) else {
        return Ok(None);
    };
    let item = value
        .get("data")
        .ok_or(EventError::MissingProperty("data"))?;
    let descriptor = kind.deserialize_item(item.to_string().as_bytes())?;
    Ok(Some((kind, key.to_string(), descriptor)))
}

/// Parses a `delete` event payload into `(kind, key, tombstone)`.
pub(crate) fn parse_delete(
    data: &str,
) -> Result<Option<(DataKind, String, ItemDescriptor)>, EventError> {
    let value: Value = serde_json::from_str(data)?;
    let path = value
        .get("path")
        .and_then(Value::as_str)
        .ok_or(EventError::MissingProperty("path"))?;
    let Some((kind, key)) = parse_path(path) else {
        return Ok(None);
    };
    let version = value
        .get("version")
        .and_then(Value::as_i64)
        .ok_or(EventError::MissingProperty("version"))?;
    Ok(Some((kind, key.to_string(), ItemDescriptor::tombstone(version))))
}

fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((FEATURES, key))
    } else if let Some(key) = path.strip_prefix("/segments/") {
        Some((SEGMENTS, key))
    } else {
        None
    }
}
