//! Resource instances and the strategy traits typed kinds implement.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{path, Descriptor, Error, Result};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// Object metadata. Fields the control plane adds that corral does not model
/// are kept in `extra` so updates never drop them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self { type_: type_.into(), status, reason: String::new(), message: String::new(), last_transition_time: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = reason.into();
        self.message = message.into();
        self
    }
}

/// Strategy a kind provides so the generic client can read its metadata and
/// status without per-kind code.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Last generation a controller has processed, if the kind reports one.
    fn observed_generation(&self) -> Option<i64> {
        None
    }

    fn conditions(&self) -> Vec<Condition> {
        Vec::new()
    }

    /// Whether the status reflects the latest spec. Kinds without an
    /// observed generation are treated as generation 0.
    fn generation_current(&self) -> bool {
        self.observed_generation().unwrap_or(0) == self.metadata().generation
    }
}

/// A resource whose descriptor is known at compile time.
pub trait Kind: Resource {
    fn descriptor() -> Descriptor;
}

/// A schema-flexible resource: typed metadata plus an untyped body holding
/// `spec`, `status` and any other top-level fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub body: Value,
}

impl Default for Instance {
    fn default() -> Self {
        Self { api_version: String::new(), kind: String::new(), metadata: ObjectMeta::default(), body: Value::Object(Default::default()) }
    }
}

impl Instance {
    pub fn new(descriptor: &Descriptor, namespace: Option<&str>, name: &str) -> Self {
        let mut obj = Self {
            api_version: descriptor.api_version(),
            kind: descriptor.kind.to_string(),
            ..Default::default()
        };
        obj.metadata.name = name.to_string();
        if descriptor.namespaced {
            obj.metadata.namespace = namespace.map(str::to_string);
        }
        obj
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.body.get("status")
    }

    /// Read a body field by dotted path, e.g. `spec.template.containers[0].image`.
    pub fn get_path(&self, p: &str) -> Option<&Value> {
        path::get(&self.body, p)
    }

    pub fn set_path(&mut self, p: &str, value: Value) -> Result<()> {
        path::set(&mut self.body, p, value)
    }

    pub fn remove_path(&mut self, p: &str) -> Option<Value> {
        path::remove(&mut self.body, p)
    }

    /// Replace or append the condition with the same type in `status.conditions`.
    pub fn set_condition(&mut self, cond: Condition) -> Result<()> {
        let mut conds = self.conditions();
        match conds.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => *existing = cond,
            None => conds.push(cond),
        }
        self.set_path("status.conditions", serde_json::to_value(conds)?)
    }

    pub fn set_observed_generation(&mut self, generation: i64) -> Result<()> {
        self.set_path("status.observedGeneration", Value::from(generation))
    }

    /// Convert any typed resource into its dynamic form, filling in the type
    /// meta from the descriptor when the typed value doesn't carry it.
    pub fn from_resource<K: Resource>(descriptor: &Descriptor, obj: &K) -> Result<Self> {
        let mut inst: Instance = serde_json::from_value(serde_json::to_value(obj)?)?;
        if inst.api_version.is_empty() {
            inst.api_version = descriptor.api_version();
        }
        if inst.kind.is_empty() {
            inst.kind = descriptor.kind.to_string();
        }
        Ok(inst)
    }

    pub fn into_resource<K: Resource>(self) -> Result<K> {
        serde_json::from_value(serde_json::to_value(self)?).map_err(Error::from)
    }
}

impl Resource for Instance {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn observed_generation(&self) -> Option<i64> {
        self.get_path("status.observedGeneration").and_then(Value::as_i64)
    }

    fn conditions(&self) -> Vec<Condition> {
        self.get_path("status.conditions")
            .and_then(|v| serde_json::from_value::<Vec<Condition>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");

    #[test]
    fn deserializes_body_and_keeps_unknown_metadata() {
        let raw = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "generation": 3,
                "labels": {"owner": "job-1"},
                "deletionGracePeriodSeconds": 30
            },
            "spec": {"replicas": 2},
            "status": {
                "observedGeneration": 2,
                "conditions": [{"type": "Ready", "status": "True", "reason": "Ok"}]
            }
        });
        let inst: Instance = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(inst.name(), "web");
        assert_eq!(inst.metadata.generation, 3);
        assert_eq!(inst.observed_generation(), Some(2));
        assert!(!inst.generation_current());
        assert_eq!(inst.conditions()[0].status, ConditionStatus::True);
        assert_eq!(inst.get_path("spec.replicas"), Some(&json!(2)));
        assert_eq!(inst.metadata.extra.get("deletionGracePeriodSeconds"), Some(&json!(30)));
        assert_eq!(serde_json::to_value(&inst).unwrap(), raw);
    }

    #[test]
    fn unknown_condition_status_reads_as_unknown() {
        let c: Condition = serde_json::from_value(json!({"type": "Ready", "status": "Maybe"})).unwrap();
        assert_eq!(c.status, ConditionStatus::Unknown);
    }

    #[test]
    fn set_condition_replaces_same_type() {
        let mut inst = Instance::new(&APPS, Some("ns"), "web");
        inst.set_condition(Condition::new("Ready", ConditionStatus::Unknown)).unwrap();
        inst.set_condition(Condition::new("Ready", ConditionStatus::True).with_reason("Done", "all good")).unwrap();
        let conds = inst.conditions();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, ConditionStatus::True);
        assert_eq!(conds[0].message, "all good");
    }

    #[test]
    fn cluster_scoped_instances_drop_namespace() {
        let ns = Descriptor::new("", "v1", "Namespace", "namespaces", false, "Namespace");
        let inst = Instance::new(&ns, Some("ignored"), "team-a");
        assert_eq!(inst.namespace(), None);
        assert_eq!(inst.api_version, "v1");
    }
}
