#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use corral_core::{Descriptor, Instance, OwnerReference, PropagationPolicy};
use corral_store::{MemoryStore, FOREGROUND_FINALIZER};
use tokio_util::sync::CancellationToken;

const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");
const PODS: Descriptor = Descriptor::new("", "v1", "Pod", "pods", true, "Pod");

fn owned_by(parent: &Instance, name: &str) -> Instance {
    let mut pod = Instance::new(&PODS, parent.namespace(), name);
    pod.metadata.owner_references.push(OwnerReference {
        api_version: parent.api_version.clone(),
        kind: parent.kind.clone(),
        name: parent.name().to_string(),
        uid: parent.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    });
    pod
}

fn seed(store: &MemoryStore) -> Instance {
    let app = store.insert(&APPS, Some("ns"), &Instance::new(&APPS, Some("ns"), "web")).unwrap();
    store.insert(&PODS, Some("ns"), &owned_by(&app, "web-1")).unwrap();
    store.insert(&PODS, Some("ns"), &owned_by(&app, "web-2")).unwrap();
    app
}

#[test]
fn foreground_holds_owner_until_dependents_are_gone() {
    let store = MemoryStore::new();
    seed(&store);

    store.remove(&APPS, Some("ns"), "web", PropagationPolicy::Foreground).unwrap();
    let held = store.fetch(&APPS, Some("ns"), "web").unwrap();
    assert!(held.metadata.deletion_timestamp.is_some());
    assert_eq!(held.metadata.finalizers, vec![FOREGROUND_FINALIZER.to_string()]);

    // first pass removes the pods, second releases the owner
    assert_eq!(store.gc_step(), 2);
    assert!(store.fetch(&APPS, Some("ns"), "web").is_ok());
    assert_eq!(store.gc_step(), 1);
    assert!(store.fetch(&APPS, Some("ns"), "web").unwrap_err().is_not_found());
    assert!(store.is_empty());
}

#[test]
fn background_removes_owner_first() {
    let store = MemoryStore::new();
    seed(&store);

    store.remove(&APPS, Some("ns"), "web", PropagationPolicy::Background).unwrap();
    assert!(store.fetch(&APPS, Some("ns"), "web").unwrap_err().is_not_found());
    assert_eq!(store.len(), 2);
    store.gc_step();
    assert!(store.is_empty());
}

#[test]
fn orphan_detaches_dependents() {
    let store = MemoryStore::new();
    seed(&store);

    store.remove(&APPS, Some("ns"), "web", PropagationPolicy::Orphan).unwrap();
    assert_eq!(store.gc_step(), 0);
    let pod = store.fetch(&PODS, Some("ns"), "web-1").unwrap();
    assert!(pod.metadata.owner_references.is_empty());
}

#[test]
fn custom_finalizer_blocks_until_cleared() {
    let store = MemoryStore::new();
    let mut obj = Instance::new(&APPS, Some("ns"), "guarded");
    obj.metadata.finalizers.push("corral.dev/cleanup".into());
    store.insert(&APPS, Some("ns"), &obj).unwrap();

    store.remove(&APPS, Some("ns"), "guarded", PropagationPolicy::Foreground).unwrap();
    assert!(store.fetch(&APPS, Some("ns"), "guarded").unwrap().metadata.deletion_timestamp.is_some());

    store
        .modify(&APPS, Some("ns"), "guarded", |o| {
            o.metadata.finalizers.clear();
            Ok(())
        })
        .unwrap();
    assert!(store.fetch(&APPS, Some("ns"), "guarded").unwrap_err().is_not_found());
}

#[tokio::test]
async fn collector_finishes_foreground_deletion() {
    let store = Arc::new(MemoryStore::new());
    seed(&store);
    let cancel = CancellationToken::new();
    let handle = store.spawn_collector(Duration::from_millis(5), cancel.clone());

    store.remove(&APPS, Some("ns"), "web", PropagationPolicy::Foreground).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !store.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "collector did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    handle.await.unwrap();
}
