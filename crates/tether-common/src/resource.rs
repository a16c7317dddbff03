//! Resource-type descriptors and object keys
//!
//! The syncer handles arbitrary resource types through `DynamicObject`, so a
//! type is described by data rather than by a Rust type parameter.

use std::fmt;

use kube::api::DynamicObject;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::ResourceExt;

use crate::kube_utils::{parse_api_version, pluralize_kind};

/// Describes one served resource type (group, version, kind)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType {
    /// API group; empty for core
    pub group: String,
    /// API version within the group (e.g. "v1")
    pub version: String,
    /// Kind (e.g. "Deployment")
    pub kind: String,
    /// Lowercase plural used in URLs (e.g. "deployments")
    pub plural: String,
    /// Whether objects live in namespaces
    pub namespaced: bool,
    /// Whether the type serves a `status` subresource
    pub status_subresource: bool,
}

impl ResourceType {
    /// Build a descriptor from an apiVersion string and kind, guessing the plural
    pub fn new(api_version: &str, kind: &str, namespaced: bool) -> Self {
        let (group, version) = parse_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            plural: pluralize_kind(kind),
            namespaced,
            status_subresource: false,
        }
    }

    /// Mark the type as serving the status subresource
    pub fn with_status(mut self) -> Self {
        self.status_subresource = true;
        self
    }

    /// Build a descriptor from discovery output
    pub fn from_discovery(ar: &ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            group: ar.group.clone(),
            version: ar.version.clone(),
            kind: ar.kind.clone(),
            plural: ar.plural.clone(),
            namespaced: caps.scope == Scope::Namespaced,
            status_subresource: caps.subresources.iter().any(|(sub, _)| sub.plural == "status"),
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// ApiResource for `Api::<DynamicObject>` construction
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// `resource.group` form used by filters and status reporting
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.plural.clone()
        } else {
            format!("{}.{}", self.plural, self.group)
        }
    }

    /// True if both descriptors name the same group, version and kind
    pub fn same_gvk(&self, other: &ResourceType) -> bool {
        self.group == other.group && self.version == other.version && self.kind == other.kind
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.api_version(), self.kind)
    }
}

/// Identity of one object within a resource type
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// Same name under a different namespace
    pub fn with_namespace(&self, namespace: Option<String>) -> Self {
        Self {
            namespace,
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
