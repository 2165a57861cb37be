//! Corral client: one generic client for every kind, parameterised by a
//! [`Descriptor`] and the [`Resource`] strategy trait.
//!
//! [`DynamicClient`] is the same client over schema-flexible [`Instance`]s
//! with a descriptor chosen at runtime.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use corral_core::{Descriptor, Error, Gateway, Instance, Kind, ListOptions, PropagationPolicy, Resource, Result};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod helpers;
mod wait;

pub use helpers::{
    all, diff_wrapper, label_equals, label_set_mutator, labels_contain, mutator_list, Mutator, Predicate,
};
pub use wait::{ConditionReporter, Wait, READY};

/// Client over schema-flexible instances.
pub type DynamicClient = Client<Instance>;

/// Hook run on every object before it is created or updated.
pub type Preprocess<K> = Arc<dyn Fn(&mut K) -> anyhow::Result<()> + Send + Sync>;

pub struct Client<K: Resource> {
    gateway: Arc<dyn Gateway>,
    descriptor: Descriptor,
    conflict_backoff: Duration,
    preprocess: Option<Preprocess<K>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> Clone for Client<K> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            descriptor: self.descriptor.clone(),
            conflict_backoff: self.conflict_backoff,
            preprocess: self.preprocess.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Kind> Client<K> {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_descriptor(gateway, K::descriptor())
    }
}

impl<K: Resource> Client<K> {
    pub fn with_descriptor(gateway: Arc<dyn Gateway>, descriptor: Descriptor) -> Self {
        Self { gateway, descriptor, conflict_backoff: Duration::ZERO, preprocess: None, _kind: PhantomData }
    }

    /// Run `hook` on every object before create and update. A hook error
    /// aborts the write as [`Error::Mutator`].
    pub fn with_preprocess<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut K) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(hook));
        self
    }

    /// Pause between conflict retries. Zero (the default) retries at once.
    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    fn friendly(&self) -> &str {
        self.descriptor.friendly_name.as_ref()
    }

    fn encode(&self, obj: &K) -> Result<Instance> {
        let Some(hook) = &self.preprocess else {
            return Instance::from_resource(&self.descriptor, obj);
        };
        let mut obj = obj.clone();
        hook(&mut obj).map_err(|e| Error::Mutator(e.into()))?;
        Instance::from_resource(&self.descriptor, &obj)
    }

    pub async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let inst = self.encode(obj)?;
        self.gateway.create(&self.descriptor, namespace, &inst).await?.into_resource()
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.gateway.get(&self.descriptor, namespace, name).await?.into_resource()
    }

    /// Optimistic replace; a stale `resourceVersion` surfaces as [`Error::Conflict`].
    pub async fn update(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let inst = self.encode(obj)?;
        self.gateway.update(&self.descriptor, namespace, &inst).await?.into_resource()
    }

    pub async fn delete(&self, namespace: Option<&str>, name: &str, policy: PropagationPolicy) -> Result<()> {
        self.gateway.delete(&self.descriptor, namespace, name, policy).await
    }

    pub async fn list(&self, namespace: Option<&str>, opts: &ListOptions) -> Result<Vec<K>> {
        self.gateway
            .list(&self.descriptor, namespace, opts)
            .await?
            .into_iter()
            .map(Instance::into_resource)
            .collect()
    }

    /// [`Client::list`], keeping only the objects `predicate` accepts.
    pub async fn list_filtered<P>(&self, namespace: Option<&str>, opts: &ListOptions, predicate: P) -> Result<Vec<K>>
    where
        P: Fn(&K) -> bool + Send + Sync,
    {
        let mut items = self.list(namespace, opts).await?;
        items.retain(|obj| predicate(obj));
        Ok(items)
    }

    /// Race a gateway call against `cancel`; a stalled call must not outlive it.
    async fn cancellable<T, Fut>(&self, name: &str, cancel: &CancellationToken, call: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.cancelled(name)),
            res = call => res,
        }
    }

    async fn after_conflict(&self, name: &str, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        counter!("corral_conflict_retries_total", 1u64);
        debug!(kind = %self.descriptor.kind, name = %name, attempt, "conflict; retrying");
        if self.conflict_backoff.is_zero() {
            tokio::task::yield_now().await;
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(self.cancelled(name)),
            _ = tokio::time::sleep(self.conflict_backoff) => Ok(()),
        }
    }

    fn cancelled(&self, name: &str) -> Error {
        Error::Timeout(format!("updating {} {name:?} cancelled", self.friendly()))
    }

    /// Read, apply `mutator`, write back. Conflicts re-read and reapply until
    /// the write lands, the mutator fails or `cancel` fires.
    pub async fn transform<F>(&self, namespace: Option<&str>, name: &str, mut mutator: F, cancel: &CancellationToken) -> Result<K>
    where
        F: FnMut(&mut K) -> anyhow::Result<()> + Send,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(name));
            }
            let mut obj = self.cancellable(name, cancel, self.get(namespace, name)).await?;
            mutator(&mut obj).map_err(|e| Error::Mutator(e.into()))?;
            match self.cancellable(name, cancel, self.update(namespace, &obj)).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    self.after_conflict(name, attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create `desired`, or merge it into the existing object. `merge` receives
    /// `(desired, existing)`; the result is written with the version just read.
    pub async fn upsert<M>(&self, namespace: Option<&str>, desired: &K, merge: M, cancel: &CancellationToken) -> Result<K>
    where
        M: Fn(&K, &K) -> K + Send + Sync,
    {
        let name = desired.metadata().name.clone();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&name));
            }
            let written = match self.cancellable(&name, cancel, self.get(namespace, &name)).await {
                Err(e) if e.is_not_found() => self.cancellable(&name, cancel, self.create(namespace, desired)).await,
                Err(e) => return Err(e),
                Ok(existing) => {
                    let mut merged = merge(desired, &existing);
                    merged.metadata_mut().resource_version = existing.metadata().resource_version.clone();
                    self.cancellable(&name, cancel, self.update(namespace, &merged)).await
                }
            };
            match written {
                Ok(obj) => return Ok(obj),
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    attempt += 1;
                    self.after_conflict(&name, attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
