//! Pure object transformations between the logical and physical sides
//!
//! Nothing here performs I/O. Downsync builds the physical object from a
//! logical one (strip, inject tracking metadata, remap namespace, apply
//! rules); upsync copies physical status onto a logical object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde_json::Value;

use tether_common::crd::{set_condition, Condition, ConditionStatus, CONDITION_SYNCED};
use tether_common::kube_utils::{
    deterministic_hash, strip_control_plane_metadata, LAST_APPLIED_ANNOTATION,
};
use tether_common::{
    ObjectKey, LAST_SYNC_ANNOTATION, LOGICAL_NAMESPACE_ANNOTATION, SYNC_TARGET_LABEL,
    SYNC_TARGET_UID_ANNOTATION, TETHER_KEY_PREFIX, WORKSPACE_ANNOTATION,
};

use crate::config::{NamespaceStrategy, TransformConfig, TransformRule};

/// Identity of the SyncTarget this syncer serves
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetIdentity {
    /// SyncTarget name
    pub name: String,
    /// SyncTarget UID
    pub uid: String,
    /// Logical-workspace path
    pub workspace: String,
}

/// Everything the transform functions need, shared by all synchronizers
#[derive(Clone, Debug)]
pub struct TransformContext {
    /// Target identity written into tracking metadata
    pub target: TargetIdentity,
    /// Namespace remapping and field rules
    pub transforms: TransformConfig,
}

impl TransformContext {
    /// Create a context
    pub fn new(target: TargetIdentity, transforms: TransformConfig) -> Self {
        Self { target, transforms }
    }

    /// Physical namespace for a logical namespace
    pub fn physical_namespace(&self, logical: &str) -> String {
        match &self.transforms.namespace {
            NamespaceStrategy::Identity => logical.to_string(),
            NamespaceStrategy::Prefixed { prefix } => format!(
                "{}-{}",
                prefix,
                deterministic_hash(&format!("{}/{}", self.target.workspace, logical))
            ),
        }
    }

    /// Physical key of a logical object key
    pub fn physical_key(&self, logical: &ObjectKey) -> ObjectKey {
        logical.with_namespace(
            logical
                .namespace
                .as_deref()
                .map(|ns| self.physical_namespace(ns)),
        )
    }

    /// Label selector for this target's objects on either side
    pub fn selector(&self) -> String {
        tether_common::sync_target_selector(&self.target.name)
    }

    /// Build the physical object for a logical one.
    ///
    /// `now` is the value written to the last-sync annotation. Status is
    /// dropped; the physical cluster owns it.
    pub fn to_physical(&self, logical: &DynamicObject, now: DateTime<Utc>) -> DynamicObject {
        let mut physical = logical.clone();
        let logical_namespace = logical.metadata.namespace.clone();

        strip_control_plane_metadata(&mut physical.metadata);
        if let Some(map) = physical.data.as_object_mut() {
            map.remove("status");
        }

        physical.metadata.namespace = logical_namespace
            .as_deref()
            .map(|ns| self.physical_namespace(ns));

        let labels = physical.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(SYNC_TARGET_LABEL.to_string(), self.target.name.clone());

        let annotations = physical.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(SYNC_TARGET_LABEL.to_string(), self.target.name.clone());
        annotations.insert(SYNC_TARGET_UID_ANNOTATION.to_string(), self.target.uid.clone());
        annotations.insert(WORKSPACE_ANNOTATION.to_string(), self.target.workspace.clone());
        if let Some(ns) = logical_namespace {
            annotations.insert(LOGICAL_NAMESPACE_ANNOTATION.to_string(), ns);
        }
        annotations.insert(LAST_SYNC_ANNOTATION.to_string(), now.to_rfc3339());

        let logical_annotations = logical.metadata.annotations.clone().unwrap_or_default();
        for rule in &self.transforms.rules {
            if rule_applies(rule, logical, &logical_annotations) {
                apply_rule(rule, &mut physical.data);
            }
        }

        physical
    }

    /// True if a physical object carries this target's tracking label
    pub fn is_tracked(&self, physical: &DynamicObject) -> bool {
        physical
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SYNC_TARGET_LABEL))
            .is_some_and(|v| *v == self.target.name)
    }
}

fn rule_applies(
    rule: &TransformRule,
    logical: &DynamicObject,
    annotations: &BTreeMap<String, String>,
) -> bool {
    let kind = logical.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    let kind_ok = rule.kinds.is_empty() || rule.kinds.iter().any(|k| k == kind);
    let annotation_ok = rule
        .when_annotation
        .as_ref()
        .map_or(true, |a| annotations.contains_key(a));
    kind_ok && annotation_ok
}

fn apply_rule(rule: &TransformRule, data: &mut Value) {
    for pointer in &rule.remove {
        remove_pointer(data, pointer);
    }
    for (pointer, value) in &rule.set {
        set_pointer(data, pointer, value.clone());
    }
}

/// Object paths in rules address the whole object (`/spec/...`), while
/// `DynamicObject::data` holds everything except metadata and type info.
fn split_pointer(pointer: &str) -> Vec<String> {
    pointer
        .trim_start_matches('/')
        .split('/')
        .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
        .collect()
}

fn escape_segment(seg: &str) -> String {
    seg.replace('~', "~0").replace('/', "~1")
}

fn set_pointer(data: &mut Value, pointer: &str, value: Value) {
    let segments = split_pointer(pointer);
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut path = String::new();
    for seg in parents {
        let Some(parent) = data.pointer_mut(&path) else {
            return;
        };
        if parent.is_null() {
            *parent = Value::Object(Default::default());
        }
        match parent {
            Value::Object(map) => {
                map.entry(seg.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            Value::Array(items) => {
                if !seg.parse::<usize>().is_ok_and(|i| i < items.len()) {
                    return;
                }
            }
            _ => return,
        }
        path.push('/');
        path.push_str(&escape_segment(seg));
    }

    match data.pointer_mut(&path) {
        Some(Value::Object(map)) => {
            map.insert(last.clone(), value);
        }
        Some(Value::Array(items)) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = value;
            }
        }
        _ => {}
    }
}

fn remove_pointer(data: &mut Value, pointer: &str) {
    let segments = split_pointer(pointer);
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let parent_pointer: String = parents
        .iter()
        .map(|s| format!("/{}", escape_segment(s)))
        .collect();
    match data.pointer_mut(&parent_pointer) {
        Some(Value::Object(map)) => {
            map.remove(last);
        }
        Some(Value::Array(items)) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

/// The comparable spec view of an object: data without status, plus
/// labels and annotations that are not tracking or kubectl bookkeeping
pub fn spec_view(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    let keep = |k: &String| !k.starts_with(TETHER_KEY_PREFIX) && k != LAST_APPLIED_ANNOTATION;
    let labels: BTreeMap<&String, &String> = obj
        .metadata
        .labels
        .iter()
        .flatten()
        .filter(|(k, _)| keep(*k))
        .collect();
    let annotations: BTreeMap<&String, &String> = obj
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| keep(*k))
        .collect();

    serde_json::json!({
        "data": data,
        "labels": labels,
        "annotations": annotations,
    })
}

/// True if every field present in `desired` is present with an equal value
/// in `actual`.
///
/// Fields only in `actual` are ignored so that server-side defaulting on
/// the physical cluster is not mistaken for drift.
pub fn contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
        (Value::Object(a), Value::Object(d)) => d.iter().all(|(k, dv)| match a.get(k) {
            Some(av) => contains(av, dv),
            None => dv.is_null(),
        }),
        (Value::Array(a), Value::Array(d)) => {
            a.len() == d.len() && a.iter().zip(d.iter()).all(|(av, dv)| contains(av, dv))
        }
        _ => actual == desired,
    }
}

/// True if the physical spec view no longer matches the desired one.
///
/// Data is compared with [`contains`]. Labels and annotations are compared
/// exactly, so a key removed on the logical side is removed physically;
/// keys under the `kubernetes.io` and `k8s.io` domains that only the
/// physical side carries are left to the cluster's own controllers.
pub fn drifted(actual: &Value, desired: &Value) -> bool {
    !contains(&actual["data"], &desired["data"])
        || !metadata_matches(&actual["labels"], &desired["labels"])
        || !metadata_matches(&actual["annotations"], &desired["annotations"])
}

fn metadata_matches(actual: &Value, desired: &Value) -> bool {
    let empty = serde_json::Map::new();
    let actual = actual.as_object().unwrap_or(&empty);
    let desired = desired.as_object().unwrap_or(&empty);
    desired.iter().all(|(k, v)| actual.get(k) == Some(v))
        && actual
            .keys()
            .all(|k| desired.contains_key(k) || is_cluster_managed_key(k))
}

fn is_cluster_managed_key(key: &str) -> bool {
    key.split_once('/').is_some_and(|(domain, _)| {
        ["kubernetes.io", "k8s.io"]
            .iter()
            .any(|reserved| domain == *reserved || domain.ends_with(&format!(".{reserved}")))
    })
}

/// Status block of an object, if any
pub fn status_of(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status").filter(|s| !s.is_null())
}

/// Logical object with its status replaced by `status`
pub fn with_status(logical: &DynamicObject, status: Option<Value>) -> DynamicObject {
    let mut updated = logical.clone();
    match status {
        Some(status) => updated.data["status"] = status,
        None => {
            if let Some(map) = updated.data.as_object_mut() {
                map.remove("status");
            }
        }
    }
    updated
}

/// Read the `Synced` condition from an object's status
pub fn synced_condition(obj: &DynamicObject) -> Option<Condition> {
    obj.data
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .filter_map(|c| serde_json::from_value::<Condition>(c.clone()).ok())
        .find(|c| c.type_ == CONDITION_SYNCED)
}

/// Logical object with a `Synced` condition upserted into its status.
///
/// Returns `None` when an equivalent condition is already present, so
/// callers can skip the write.
pub fn with_synced_condition(
    logical: &DynamicObject,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Option<DynamicObject> {
    let condition = Condition::new(CONDITION_SYNCED, status, reason, message);
    if synced_condition(logical).is_some_and(|c| c.same_state(&condition)) {
        return None;
    }

    let mut conditions: Vec<Condition> = logical
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    set_condition(&mut conditions, condition);

    let mut updated = logical.clone();
    let conditions = serde_json::to_value(conditions).ok()?;
    match updated.data.get_mut("status") {
        Some(Value::Object(status)) => {
            status.insert("conditions".to_string(), conditions);
        }
        _ => updated.data["status"] = serde_json::json!({ "conditions": conditions }),
    }
    Some(updated)
}

/// Logical key a physical object was synced from
pub fn logical_key_of(physical: &DynamicObject) -> ObjectKey {
    let namespace = physical
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LOGICAL_NAMESPACE_ANNOTATION))
        .cloned()
        .or_else(|| physical.metadata.namespace.clone());
    ObjectKey {
        namespace,
        name: physical.metadata.name.clone().unwrap_or_default(),
    }
}

/// True if the logical object is gone or on its way out
pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}
