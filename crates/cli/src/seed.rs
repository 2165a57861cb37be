//! Load objects from a multi-document YAML file into the in-memory store.

use std::path::Path;

use anyhow::{Context, Result};
use corral_core::Instance;
use corral_store::MemoryStore;
use serde::Deserialize;
use tracing::info;

use crate::registry;

pub fn load(store: &MemoryStore, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading seed file {}", path.display()))?;
    let n = load_str(store, &text).with_context(|| format!("loading seed file {}", path.display()))?;
    info!(path = %path.display(), objects = n, "seeded in-memory store");
    Ok(n)
}

pub fn load_str(store: &MemoryStore, text: &str) -> Result<usize> {
    let mut n = 0;
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_json::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let obj: Instance = serde_json::from_value(value)?;
        let descriptor = registry::find(&obj.api_version, &obj.kind)
            .with_context(|| format!("unknown kind {}/{}", obj.api_version, obj.kind))?;
        if !descriptor.namespaced && descriptor.kind == "Namespace" {
            store.add_namespace(obj.name());
        }
        store.insert(&descriptor, obj.namespace(), &obj)?;
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{APPS, NAMESPACES};

    #[test]
    fn loads_every_document() {
        let store = MemoryStore::new();
        let text = "\
apiVersion: v1
kind: Namespace
metadata:
  name: staging
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
  labels:
    tier: web
spec:
  replicas: 2
---
";
        assert_eq!(load_str(&store, text).unwrap(), 2);
        let web = store.fetch(&APPS, Some("prod"), "web").unwrap();
        assert_eq!(web.metadata.labels.get("tier").map(String::as_str), Some("web"));
        assert_eq!(web.spec().and_then(|s| s.get("replicas")), Some(&serde_json::json!(2)));
        assert!(store.fetch(&NAMESPACES, None, "staging").is_ok());
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let store = MemoryStore::new();
        let err = load_str(&store, "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n").unwrap_err();
        assert_eq!(err.to_string(), "unknown kind example.com/v1/Widget");
    }
}
