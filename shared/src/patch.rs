//! Structural diff and patch application over the JSON state tree
//!
//! A [`Patch`] is one `add`/`remove`/`replace` edit at a path into the state.
//! [`diff`] produces the ordered edit list that turns one snapshot into another,
//! and [`apply_patches`] replays such a list against a replica.
//!
//! The differ walks maps in key order and sequences by index. It does not try
//! to detect moved or reordered elements: a removal in the middle of a list
//! shows up as replacements of the following elements plus a trailing remove.
//! That keeps the algorithm generic over any state shape and makes replaying
//! the list in emission order reproduce the target exactly.

use crate::error::SyncError;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a path into the state tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{}", index),
            PathSegment::Key(key) => write!(f, "{}", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// A single structural edit
///
/// Serialized as `{"op": "replace", "path": ["characters", 0, "color"], "value": ...}`.
/// `value` is omitted for `remove`. A present `null` value is kept as `Some(Value::Null)`
/// so that replacing a field with `null` survives the round trip.
///
/// Decoding never fails on a single entry. An entry that is not a valid edit
/// (unknown `op`, negative index, non-string key) decodes as a rejected patch,
/// which [`apply_patches`] skips like any other malformed edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip)]
    rejected: Option<String>,
}

#[derive(Deserialize)]
struct WirePatch {
    op: PatchOp,
    path: Vec<PathSegment>,
    #[serde(default, deserialize_with = "deserialize_present")]
    value: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Ok(match WirePatch::deserialize(&raw) {
            Ok(wire) => Self {
                op: wire.op,
                path: wire.path,
                value: wire.value,
                rejected: None,
            },
            Err(e) => Self {
                op: PatchOp::Replace,
                path: Vec::new(),
                value: Some(raw),
                rejected: Some(e.to_string()),
            },
        })
    }
}

impl Patch {
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
            rejected: None,
        }
    }

    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
            rejected: None,
        }
    }

    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
            rejected: None,
        }
    }

    /// Why the entry could not be decoded, for patches read off the wire
    pub fn rejection(&self) -> Option<&str> {
        self.rejected.as_deref()
    }

    /// True for a `replace` that targets the state root
    pub fn is_root_replace(&self) -> bool {
        self.rejected.is_none() && self.op == PatchOp::Replace && self.path.is_empty()
    }
}

/// Renders a path as a JSON-pointer-like string for log output
pub fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{}", segment)).collect()
}

/// True when the batch is exactly one root-level `replace`, i.e. a snapshot in patch form
pub fn is_full_replacement(patches: &[Patch]) -> bool {
    matches!(patches, [only] if only.is_root_replace())
}

/// Value of the root-level `replace` that governs this batch, if it has one
///
/// Any batch carrying a root replace is treated as a full replacement; when
/// several are present the last one wins.
pub fn root_replacement(patches: &[Patch]) -> Option<&Value> {
    patches
        .iter()
        .rev()
        .find(|patch| patch.is_root_replace())
        .and_then(|patch| patch.value.as_ref())
}

/// Computes the ordered edits that turn `before` into `after`
pub fn diff(before: &Value, after: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut path = Vec::new();
    diff_into(before, after, &mut path, &mut patches);
    patches
}

fn diff_into(before: &Value, after: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<Patch>) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff_into(old_value, new_value, path, out),
                    None => out.push(Patch::remove(path.clone())),
                }
                path.pop();
            }

            for (key, new_value) in new {
                if !old.contains_key(key) {
                    let mut child = path.clone();
                    child.push(PathSegment::Key(key.clone()));
                    out.push(Patch::add(child, new_value.clone()));
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());

            for index in 0..common {
                path.push(PathSegment::Index(index));
                diff_into(&old[index], &new[index], path, out);
                path.pop();
            }

            for (index, new_value) in new.iter().enumerate().skip(common) {
                let mut child = path.clone();
                child.push(PathSegment::Index(index));
                out.push(Patch::add(child, new_value.clone()));
            }

            // Trailing removals go highest index first so each one stays valid
            for index in (common..old.len()).rev() {
                let mut child = path.clone();
                child.push(PathSegment::Index(index));
                out.push(Patch::remove(child));
            }
        }
        _ => out.push(Patch::replace(path.clone(), after.clone())),
    }
}

/// Outcome of replaying a batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub full_replacement: bool,
}

/// Applies a batch in order
///
/// A batch holding a root-level `replace` replaces the whole target and its
/// other edits are ignored. Otherwise each edit is applied in turn; an edit
/// whose path does not resolve is logged and skipped without aborting the rest.
pub fn apply_patches(target: &mut Value, patches: &[Patch]) -> ApplyReport {
    if let Some(root) = root_replacement(patches) {
        if patches.len() > 1 {
            warn!(
                "Patch batch mixes a root replace with {} other edit(s); treating it as a full replacement",
                patches.len() - 1
            );
        }
        *target = root.clone();
        return ApplyReport {
            applied: 1,
            skipped: patches.len() - 1,
            full_replacement: true,
        };
    }

    let mut report = ApplyReport::default();
    for patch in patches {
        match apply_patch(target, patch) {
            Ok(()) => report.applied += 1,
            Err(e) => {
                warn!("Skipping patch: {}", e);
                report.skipped += 1;
            }
        }
    }
    report
}

/// Applies one edit, failing if its path does not resolve against `target`
pub fn apply_patch(target: &mut Value, patch: &Patch) -> Result<(), SyncError> {
    let malformed = |reason: &str| SyncError::MalformedPatch {
        path: display_path(&patch.path),
        reason: reason.to_string(),
    };

    if let Some(reason) = patch.rejection() {
        return Err(SyncError::MalformedPatch {
            path: patch.value.as_ref().map_or_else(String::new, Value::to_string),
            reason: reason.to_string(),
        });
    }

    let Some((last, parents)) = patch.path.split_last() else {
        return match (patch.op, &patch.value) {
            (PatchOp::Remove, _) => Err(malformed("the state root cannot be removed")),
            (_, Some(value)) => {
                *target = value.clone();
                Ok(())
            }
            (_, None) => Err(malformed("missing value")),
        };
    };

    let mut current = target;
    for segment in parents {
        current = child_mut(current, segment).ok_or_else(|| malformed("parent does not exist"))?;
    }

    match current {
        Value::Object(map) => {
            let key = match last {
                PathSegment::Key(key) => key.clone(),
                PathSegment::Index(index) => index.to_string(),
            };
            match patch.op {
                PatchOp::Add => {
                    let value = patch.value.clone().ok_or_else(|| malformed("missing value"))?;
                    map.insert(key, value);
                }
                PatchOp::Replace => {
                    let value = patch.value.clone().ok_or_else(|| malformed("missing value"))?;
                    let slot = map
                        .get_mut(&key)
                        .ok_or_else(|| malformed("replace target does not exist"))?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    map.remove(&key)
                        .ok_or_else(|| malformed("remove target does not exist"))?;
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let index = segment_index(last).ok_or_else(|| malformed("array index expected"))?;
            match patch.op {
                PatchOp::Add => {
                    if index > items.len() {
                        return Err(malformed("add index out of bounds"));
                    }
                    let value = patch.value.clone().ok_or_else(|| malformed("missing value"))?;
                    items.insert(index, value);
                }
                PatchOp::Replace => {
                    let value = patch.value.clone().ok_or_else(|| malformed("missing value"))?;
                    let slot = items
                        .get_mut(index)
                        .ok_or_else(|| malformed("replace index out of bounds"))?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    if index >= items.len() {
                        return Err(malformed("remove index out of bounds"));
                    }
                    items.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(malformed("parent is not a container")),
    }
}

fn segment_index(segment: &PathSegment) -> Option<usize> {
    match segment {
        PathSegment::Index(index) => Some(*index),
        PathSegment::Key(key) => key.parse().ok(),
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => match segment {
            PathSegment::Key(key) => map.get_mut(key),
            PathSegment::Index(index) => map.get_mut(&index.to_string()),
        },
        Value::Array(items) => segment_index(segment).and_then(move |index| items.get_mut(index)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(before: Value, after: Value) {
        let patches = diff(&before, &after);
        let mut replica = before.clone();
        let report = apply_patches(&mut replica, &patches);
        assert_eq!(report.skipped, 0, "patches: {:?}", patches);
        assert_eq!(replica, after, "patches: {:?}", patches);
    }

    #[test]
    fn test_equal_states_produce_no_patches() {
        let state = json!({"characters": [{"id": "a"}], "serverTime": 5});
        assert!(diff(&state, &state).is_empty());
    }

    #[test]
    fn test_scalar_field_change_is_a_single_replace() {
        let before = json!({"serverTime": 1, "name": "room"});
        let after = json!({"serverTime": 2, "name": "room"});

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![Patch::replace(vec!["serverTime".into()], json!(2))]
        );
    }

    #[test]
    fn test_object_keys_added_and_removed() {
        let before = json!({"a": 1, "b": 2});
        let after = json!({"b": 2, "c": 3});

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![
                Patch::remove(vec!["a".into()]),
                Patch::add(vec!["c".into()], json!(3)),
            ]
        );
        roundtrip(before, after);
    }

    #[test]
    fn test_array_growth_appends_in_order() {
        let before = json!({"characters": [{"id": "a"}]});
        let after = json!({"characters": [{"id": "a"}, {"id": "b"}, {"id": "c"}]});

        let patches = diff(&before, &after);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].path, vec!["characters".into(), 1.into()]);
        assert_eq!(patches[1].path, vec!["characters".into(), 2.into()]);
        roundtrip(before, after);
    }

    #[test]
    fn test_array_shrink_removes_from_the_end() {
        let before = json!({"list": [1, 2, 3, 4]});
        let after = json!({"list": [1, 2]});

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![
                Patch::remove(vec!["list".into(), 3.into()]),
                Patch::remove(vec!["list".into(), 2.into()]),
            ]
        );
        roundtrip(before, after);
    }

    #[test]
    fn test_removing_the_head_of_a_list_roundtrips() {
        roundtrip(
            json!({"characters": [{"id": "a", "x": 1}, {"id": "b", "x": 2}]}),
            json!({"characters": [{"id": "b", "x": 2}]}),
        );
    }

    #[test]
    fn test_kind_change_replaces_the_subtree() {
        let before = json!({"value": {"nested": true}});
        let after = json!({"value": [1, 2]});

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![Patch::replace(vec!["value".into()], json!([1, 2]))]
        );
    }

    #[test]
    fn test_root_kind_change_is_a_full_replacement() {
        let patches = diff(&json!({"a": 1}), &json!([1]));
        assert!(is_full_replacement(&patches));
    }

    #[test]
    fn test_deeply_nested_roundtrip() {
        roundtrip(
            json!({
                "characters": [
                    {"id": "a", "position": {"x": 1.0, "y": 2.0}, "tags": ["red"]},
                    {"id": "b", "position": {"x": 3.0, "y": 4.0}, "tags": []}
                ],
                "serverTime": 10,
                "meta": null
            }),
            json!({
                "characters": [
                    {"id": "a", "position": {"x": 1.5, "y": 2.0}, "tags": ["red", "fast"]},
                    {"id": "c", "position": {"x": 0.0, "y": 0.0}}
                ],
                "serverTime": 11,
                "meta": {"round": 2}
            }),
        );
    }

    #[test]
    fn test_full_replacement_overwrites_everything() {
        let mut state = json!({"foo": 0, "bar": [1, 2]});
        let patches = vec![Patch::replace(vec![], json!({"foo": 1}))];
        assert!(is_full_replacement(&patches));

        let report = apply_patches(&mut state, &patches);
        assert!(report.full_replacement);
        assert_eq!(state, json!({"foo": 1}));
    }

    #[test]
    fn test_mixed_batch_with_root_replace_ignores_incremental_ops() {
        let mut state = json!({"foo": 0});
        let patches = vec![
            Patch::add(vec!["extra".into()], json!(true)),
            Patch::replace(vec![], json!({"foo": 7})),
            Patch::replace(vec!["foo".into()], json!(8)),
        ];
        assert!(!is_full_replacement(&patches));

        let report = apply_patches(&mut state, &patches);
        assert!(report.full_replacement);
        assert_eq!(report.skipped, 2);
        assert_eq!(state, json!({"foo": 7}));
    }

    #[test]
    fn test_malformed_patch_is_skipped_and_batch_continues() {
        let mut state = json!({"characters": [], "serverTime": 0});
        let patches = vec![
            Patch::replace(vec!["missing".into(), "deep".into()], json!(1)),
            Patch::remove(vec!["characters".into(), 4.into()]),
            Patch::replace(vec!["serverTime".into()], json!(99)),
        ];

        let report = apply_patches(&mut state, &patches);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(state["serverTime"], json!(99));
    }

    #[test]
    fn test_undecodable_entry_is_skipped_and_batch_continues() {
        let patches: Vec<Patch> = serde_json::from_value(json!([
            {"op": "replace", "path": ["serverTime"], "value": 99},
            {"op": "replace", "path": ["characters", -1], "value": 1},
            {"op": "move", "path": ["serverTime"], "value": 1},
            {"op": "add", "path": [true], "value": 1},
            {"op": "replace", "path": ["tickCount"], "value": 3}
        ]))
        .unwrap();
        assert!(patches[0].rejection().is_none());
        assert!(patches[1].rejection().is_some());

        let mut state = json!({"characters": [], "serverTime": 0, "tickCount": 0});
        let report = apply_patches(&mut state, &patches);

        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 3);
        assert!(!report.full_replacement);
        assert_eq!(state, json!({"characters": [], "serverTime": 99, "tickCount": 3}));
    }

    #[test]
    fn test_replace_requires_an_existing_target() {
        let mut state = json!({"a": 1});
        let result = apply_patch(&mut state, &Patch::replace(vec!["b".into()], json!(2)));
        assert!(matches!(result, Err(SyncError::MalformedPatch { .. })));
        assert_eq!(state, json!({"a": 1}));
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut state = json!({"a": 1});
        assert!(apply_patch(&mut state, &Patch::remove(vec![])).is_err());
    }

    #[test]
    fn test_patches_must_be_applied_in_order() {
        let v0 = json!({"list": [1]});
        let v1 = json!({"list": [1, 2]});
        let v2 = json!({"list": [1, 2, 3]});
        let first = diff(&v0, &v1);
        let second = diff(&v1, &v2);

        let mut in_order = v0.clone();
        apply_patches(&mut in_order, &first);
        apply_patches(&mut in_order, &second);
        assert_eq!(in_order, v2);

        // Out of order: the second batch's add at index 2 cannot resolve yet
        let mut reordered = v0.clone();
        let report = apply_patches(&mut reordered, &second);
        assert_eq!(report.skipped, 1);
        apply_patches(&mut reordered, &first);
        assert_ne!(reordered, v2);

        // Dropping a batch diverges as well
        let mut dropped = v0;
        apply_patches(&mut dropped, &second);
        assert_ne!(dropped, v2);
    }

    #[test]
    fn test_patch_wire_format() {
        let patch = Patch::replace(vec!["characters".into(), 0.into(), "color".into()], json!("red"));
        let encoded = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            encoded,
            json!({"op": "replace", "path": ["characters", 0, "color"], "value": "red"})
        );

        let removal = serde_json::to_value(Patch::remove(vec!["a".into()])).unwrap();
        assert_eq!(removal, json!({"op": "remove", "path": ["a"]}));
    }

    #[test]
    fn test_null_value_survives_decoding() {
        let decoded: Patch =
            serde_json::from_value(json!({"op": "replace", "path": ["meta"], "value": null}))
                .unwrap();
        assert_eq!(decoded.value, Some(Value::Null));

        let decoded: Patch = serde_json::from_value(json!({"op": "remove", "path": ["meta"]})).unwrap();
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn test_display_path() {
        assert_eq!(display_path(&[]), "/");
        assert_eq!(
            display_path(&["characters".into(), 2.into(), "x".into()]),
            "/characters/2/x"
        );
    }
}
