//! Corral store: an in-RAM gateway with resource versions, finalizers and a
//! small garbage collector for owner references.
//!
//! Used as the test double for every layer above the gateway and as the
//! backend of `corral --in-memory`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use corral_core::{Descriptor, Error, Gateway, Instance, ListOptions, NamespaceLister, PropagationPolicy, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Finalizer that holds an owner until its dependents are gone.
pub const FOREGROUND_FINALIZER: &str = "foregroundDeletion";

/// (qualified resource, namespace or "", name)
type Key = (String, String, String);

struct Stored {
    descriptor: Descriptor,
    obj: Instance,
}

#[derive(Default)]
struct State {
    objects: FxHashMap<Key, Stored>,
    namespaces: BTreeSet<String>,
    next_rv: u64,
    pending_conflicts: usize,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn scope(descriptor: &Descriptor, namespace: Option<&str>) -> Result<String> {
    if !descriptor.namespaced {
        return Ok(String::new());
    }
    match namespace {
        Some(ns) if !ns.is_empty() => Ok(ns.to_string()),
        _ => Err(Error::Validation(format!("{} is namespaced; a namespace is required", descriptor.friendly_name))),
    }
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn dependents_of(&self, uid: &str) -> Vec<Key> {
        let mut out: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, s)| s.obj.metadata.owner_references.iter().any(|o| o.uid == uid))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    fn detach(&mut self, key: &Key, owner_uid: &str) {
        let rv = self.bump();
        if let Some(s) = self.objects.get_mut(key) {
            s.obj.metadata.owner_references.retain(|o| o.uid != owner_uid);
            s.obj.metadata.resource_version = Some(rv);
        }
    }

    /// Start deleting `key`. Objects without finalizers disappear at once;
    /// the rest get a deletion timestamp and wait for their finalizers.
    fn begin_delete(&mut self, key: &Key, policy: PropagationPolicy) -> bool {
        let uid = match self.objects.get(key) {
            Some(s) if s.obj.metadata.deletion_timestamp.is_none() => s.obj.metadata.uid.clone().unwrap_or_default(),
            _ => return false,
        };
        let dependents = self.dependents_of(&uid);
        let mut hold = false;
        match policy {
            PropagationPolicy::Orphan => {
                for d in &dependents {
                    self.detach(d, &uid);
                }
            }
            PropagationPolicy::Background => {}
            PropagationPolicy::Foreground => hold = !dependents.is_empty(),
        }
        let rv = self.bump();
        let remove = match self.objects.get_mut(key) {
            Some(s) => {
                let meta = &mut s.obj.metadata;
                if hold {
                    meta.finalizers.push(FOREGROUND_FINALIZER.to_string());
                }
                if meta.finalizers.is_empty() {
                    true
                } else {
                    meta.deletion_timestamp = Some(now());
                    meta.resource_version = Some(rv);
                    false
                }
            }
            None => return false,
        };
        if remove {
            self.objects.remove(key);
        }
        true
    }

    fn drop_finalizer(&mut self, key: &Key, finalizer: &str) {
        let rv = self.bump();
        let remove = match self.objects.get_mut(key) {
            Some(s) => {
                let meta = &mut s.obj.metadata;
                meta.finalizers.retain(|f| f != finalizer);
                meta.resource_version = Some(rv);
                meta.finalizers.is_empty() && meta.deletion_timestamp.is_some()
            }
            None => false,
        };
        if remove {
            self.objects.remove(key);
        }
    }
}

/// In-memory [`Gateway`] and [`NamespaceLister`].
///
/// Resource versions are a single monotonically increasing counter shared by
/// every object. Updates carrying a stale `resourceVersion` fail with
/// [`Error::Conflict`]; updates that change nothing return the stored object
/// untouched.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    gets: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    /// Make the next `n` updates fail with a conflict regardless of version.
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().pending_conflicts += n;
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        if obj.name().is_empty() {
            return Err(Error::Validation(format!("{} name is required", descriptor.friendly_name)));
        }
        let ns = scope(descriptor, namespace.or(obj.namespace()))?;
        let key = (descriptor.qualified_resource(), ns.clone(), obj.name().to_string());
        let mut st = self.lock();
        if st.objects.contains_key(&key) {
            return Err(Error::already_exists(descriptor.friendly_name.as_ref(), obj.name()));
        }
        let mut stored = obj.clone();
        stored.api_version = descriptor.api_version();
        stored.kind = descriptor.kind.to_string();
        let rv = st.bump();
        let meta = &mut stored.metadata;
        meta.namespace = descriptor.namespaced.then(|| ns.clone());
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.generation = 1;
        meta.resource_version = Some(rv);
        meta.creation_timestamp = Some(now());
        meta.deletion_timestamp = None;
        if descriptor.namespaced {
            st.namespaces.insert(ns);
        }
        debug!(kind = %descriptor.kind, name = %stored.name(), ns = ?stored.namespace(), "created");
        st.objects.insert(key, Stored { descriptor: descriptor.clone(), obj: stored.clone() });
        Ok(stored)
    }

    pub fn fetch(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str) -> Result<Instance> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let key = (descriptor.qualified_resource(), scope(descriptor, namespace)?, name.to_string());
        self.lock()
            .objects
            .get(&key)
            .map(|s| s.obj.clone())
            .ok_or_else(|| Error::not_found(descriptor.friendly_name.as_ref(), name))
    }

    pub fn replace(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        let kind = descriptor.friendly_name.as_ref();
        let ns = scope(descriptor, namespace.or(obj.namespace()))?;
        let key = (descriptor.qualified_resource(), ns, obj.name().to_string());
        let mut st = self.lock();
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            return Err(Error::conflict(kind, obj.name()));
        }
        let current = st
            .objects
            .get(&key)
            .map(|s| s.obj.clone())
            .ok_or_else(|| Error::not_found(kind, obj.name()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if Some(rv) != current.metadata.resource_version.as_deref() {
                return Err(Error::conflict(kind, obj.name()));
            }
        }

        let mut next = obj.clone();
        next.api_version = current.api_version.clone();
        next.kind = current.kind.clone();
        let meta = &mut next.metadata;
        meta.namespace = current.metadata.namespace.clone();
        meta.uid = current.metadata.uid.clone();
        meta.creation_timestamp = current.metadata.creation_timestamp.clone();
        meta.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        meta.generation = current.metadata.generation;
        meta.resource_version = current.metadata.resource_version.clone();
        if next == current {
            return Ok(current);
        }
        if next.spec() != current.spec() {
            next.metadata.generation += 1;
        }
        next.metadata.resource_version = Some(st.bump());
        if next.metadata.deletion_timestamp.is_some() && next.metadata.finalizers.is_empty() {
            debug!(kind = %descriptor.kind, name = %next.name(), "last finalizer removed");
            st.objects.remove(&key);
        } else {
            st.objects.insert(key, Stored { descriptor: descriptor.clone(), obj: next.clone() });
        }
        Ok(next)
    }

    /// Read-modify-write without version checks, for simulating controllers in tests.
    pub fn modify(
        &self,
        descriptor: &Descriptor,
        namespace: Option<&str>,
        name: &str,
        f: impl FnOnce(&mut Instance) -> Result<()>,
    ) -> Result<Instance> {
        let mut obj = self.fetch(descriptor, namespace, name)?;
        f(&mut obj)?;
        obj.metadata.resource_version = None;
        self.replace(descriptor, namespace, &obj)
    }

    pub fn remove(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str, policy: PropagationPolicy) -> Result<()> {
        let key = (descriptor.qualified_resource(), scope(descriptor, namespace)?, name.to_string());
        let mut st = self.lock();
        if !st.objects.contains_key(&key) {
            return Err(Error::not_found(descriptor.friendly_name.as_ref(), name));
        }
        st.begin_delete(&key, policy);
        debug!(kind = %descriptor.kind, name = %name, ?policy, "delete requested");
        Ok(())
    }

    pub fn select(&self, descriptor: &Descriptor, namespace: Option<&str>, opts: &ListOptions) -> Result<Vec<Instance>> {
        for req in opts.field_selector.requirements() {
            if !matches!(req.key(), "metadata.name" | "metadata.namespace") {
                return Err(Error::Validation(format!("field selector {:?} is not supported", req.key())));
            }
        }
        let resource = descriptor.qualified_resource();
        let ns = match (descriptor.namespaced, namespace) {
            (true, Some(ns)) if !ns.is_empty() => Some(ns),
            _ => None,
        };
        let st = self.lock();
        let mut out: Vec<Instance> = st
            .objects
            .iter()
            .filter(|((r, n, _), _)| *r == resource && ns.map_or(true, |ns| n == ns))
            .map(|(_, s)| &s.obj)
            .filter(|o| opts.label_selector.matches(&o.metadata.labels))
            .filter(|o| {
                let mut fields = BTreeMap::new();
                fields.insert("metadata.name".to_string(), o.name().to_string());
                fields.insert("metadata.namespace".to_string(), o.namespace().unwrap_or_default().to_string());
                opts.field_selector.matches(&fields)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
        Ok(out)
    }

    /// One garbage-collection pass. Returns how many objects changed.
    ///
    /// Owners held by the foreground finalizer delete their dependents and are
    /// released once none remain; dependents whose owners are all gone are
    /// deleted.
    pub fn gc_step(&self) -> usize {
        let mut st = self.lock();
        let mut changes = 0;

        let mut holding: Vec<(Key, String)> = st
            .objects
            .iter()
            .filter(|(_, s)| s.obj.metadata.finalizers.iter().any(|f| f == FOREGROUND_FINALIZER))
            .map(|(k, s)| (k.clone(), s.obj.metadata.uid.clone().unwrap_or_default()))
            .collect();
        holding.sort();
        for (key, uid) in holding {
            let dependents = st.dependents_of(&uid);
            if dependents.is_empty() {
                st.drop_finalizer(&key, FOREGROUND_FINALIZER);
                changes += 1;
                continue;
            }
            for d in dependents {
                if st.begin_delete(&d, PropagationPolicy::Foreground) {
                    changes += 1;
                }
            }
        }

        let live: FxHashSet<String> = st.objects.values().filter_map(|s| s.obj.metadata.uid.clone()).collect();
        let mut orphaned: Vec<Key> = st
            .objects
            .iter()
            .filter(|(_, s)| {
                let owners = &s.obj.metadata.owner_references;
                !owners.is_empty() && owners.iter().all(|o| !live.contains(&o.uid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        orphaned.sort();
        for key in orphaned {
            if st.begin_delete(&key, PropagationPolicy::Background) {
                changes += 1;
            }
        }

        if changes > 0 {
            let kinds: BTreeSet<&str> = st.objects.values().map(|s| s.descriptor.kind.as_ref()).collect();
            debug!(changes, remaining_kinds = ?kinds, "gc pass");
        }
        changes
    }

    /// Run [`MemoryStore::gc_step`] every `period` until `cancel` fires.
    pub fn spawn_collector(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.gc_step();
                    }
                }
            }
            info!("collector stopped");
        })
    }
}

#[async_trait::async_trait]
impl Gateway for MemoryStore {
    async fn create(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        self.insert(descriptor, namespace, obj)
    }

    async fn get(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str) -> Result<Instance> {
        self.fetch(descriptor, namespace, name)
    }

    async fn update(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        self.replace(descriptor, namespace, obj)
    }

    async fn delete(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str, policy: PropagationPolicy) -> Result<()> {
        self.remove(descriptor, namespace, name, policy)
    }

    async fn list(&self, descriptor: &Descriptor, namespace: Option<&str>, opts: &ListOptions) -> Result<Vec<Instance>> {
        self.select(descriptor, namespace, opts)
    }
}

#[async_trait::async_trait]
impl NamespaceLister for MemoryStore {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.lock().namespaces.iter().cloned().collect())
    }
}
