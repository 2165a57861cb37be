//! Corral core types: resource descriptors, instances, selectors, errors and
//! the gateway contract every backend implements.

#![forbid(unsafe_code)]

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod instance;
pub mod path;
pub mod selector;

pub use error::{Error, Result};
pub use instance::{Condition, ConditionStatus, Instance, Kind, ObjectMeta, OwnerReference, Resource};
pub use selector::{Operator, Requirement, Selector};

pub mod prelude {
    pub use super::{
        Condition, ConditionStatus, Descriptor, Error, Gateway, Instance, Kind, ListOptions, NamespaceLister,
        ObjectMeta, PropagationPolicy, Resource, Result, Selector,
    };
}

/// Static description of a resource kind served by the control plane.
///
/// Compiled-in kinds use [`Descriptor::new`] in a `const`; kinds found through
/// discovery build one at runtime with owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub group: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub kind: Cow<'static, str>,
    /// Plural resource name used in API paths, e.g. `deployments`.
    pub resource: Cow<'static, str>,
    pub namespaced: bool,
    /// User-facing name, e.g. `App` for a `Deployment` backed kind.
    pub friendly_name: Cow<'static, str>,
}

impl Descriptor {
    pub const fn new(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        resource: &'static str,
        namespaced: bool,
        friendly_name: &'static str,
    ) -> Self {
        Self {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            kind: Cow::Borrowed(kind),
            resource: Cow::Borrowed(resource),
            namespaced,
            friendly_name: Cow::Borrowed(friendly_name),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    pub fn plural_friendly_name(&self) -> String {
        format!("{}s", self.friendly_name)
    }

    /// `resource.group` form used by `-o name` output.
    pub fn qualified_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.to_string()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// How dependents of a deleted object are handled by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// The parent disappears only after every dependent is gone.
    #[default]
    Foreground,
    /// The parent is removed immediately; dependents are collected later.
    Background,
    /// Dependents are detached and left in place.
    Orphan,
}

impl std::str::FromStr for PropagationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "foreground" => Ok(Self::Foreground),
            "background" => Ok(Self::Background),
            "orphan" => Ok(Self::Orphan),
            other => Err(Error::Validation(format!(
                "unknown propagation policy {other:?} (expect foreground, background or orphan)"
            ))),
        }
    }
}

/// Server-side filtering for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Selector,
    /// Only `metadata.name` and `metadata.namespace` are guaranteed to be honoured.
    pub field_selector: Selector,
}

impl ListOptions {
    pub fn labels(mut self, selector: Selector) -> Self {
        self.label_selector = selector;
        self
    }

    pub fn fields(mut self, selector: Selector) -> Self {
        self.field_selector = selector;
        self
    }
}

/// Access to the control plane's canonical object store.
///
/// Backends must report optimistic-concurrency failures as [`Error::Conflict`]
/// and missing objects as [`Error::NotFound`]. For cluster-scoped descriptors
/// the namespace argument is ignored; for namespaced descriptors a `None`
/// namespace on `list` means all namespaces.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn create(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance>;

    async fn get(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str) -> Result<Instance>;

    /// Replace an existing object. `metadata.resourceVersion` must match the stored one.
    async fn update(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance>;

    async fn delete(
        &self,
        descriptor: &Descriptor,
        namespace: Option<&str>,
        name: &str,
        policy: PropagationPolicy,
    ) -> Result<()>;

    async fn list(&self, descriptor: &Descriptor, namespace: Option<&str>, opts: &ListOptions) -> Result<Vec<Instance>>;
}

/// Lists the namespaces the current user can target.
#[async_trait::async_trait]
pub trait NamespaceLister: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>>;
}
