//! Corral kubehub: the cluster-backed gateway, namespace listing and served
//! kind discovery.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::time::Instant;

use corral_core::{Descriptor, Error, Gateway, Instance, ListOptions, NamespaceLister, PropagationPolicy, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tracing::{debug, info};

fn api_resource(d: &Descriptor) -> ApiResource {
    ApiResource {
        group: d.group.to_string(),
        version: d.version.to_string(),
        api_version: d.api_version(),
        kind: d.kind.to_string(),
        plural: d.resource.to_string(),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_dynamic(obj: &Instance) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn from_dynamic(obj: DynamicObject) -> Result<Instance> {
    let mut raw = serde_json::to_value(&obj)?;
    strip_managed_fields(&mut raw);
    Ok(serde_json::from_value(raw)?)
}

/// Map API status codes onto the corral taxonomy.
fn map_err(d: &Descriptor, name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(d.friendly_name.as_ref(), name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(d.friendly_name.as_ref(), name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(d.friendly_name.as_ref(), name),
        kube::Error::Api(ae) => Error::Gateway(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        other => Error::Gateway(other.to_string()),
    }
}

fn observe(verb: &'static str, started: Instant) {
    counter!("corral_gateway_requests_total", 1u64, "verb" => verb);
    histogram!("corral_gateway_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
}

/// [`Gateway`] over a live cluster. The client is built once and shared.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Configuration(format!("connecting to the cluster: {e}")))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, d: &Descriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(d);
        match namespace {
            Some(ns) if d.namespaced && !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl Gateway for KubeGateway {
    async fn create(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        let started = Instant::now();
        let api = self.api(descriptor, namespace.or(obj.namespace()));
        let res = api.create(&PostParams::default(), &to_dynamic(obj)?).await;
        observe("create", started);
        from_dynamic(res.map_err(|e| map_err(descriptor, obj.name(), e))?)
    }

    async fn get(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str) -> Result<Instance> {
        let started = Instant::now();
        let res = self.api(descriptor, namespace).get(name).await;
        observe("get", started);
        from_dynamic(res.map_err(|e| map_err(descriptor, name, e))?)
    }

    async fn update(&self, descriptor: &Descriptor, namespace: Option<&str>, obj: &Instance) -> Result<Instance> {
        let started = Instant::now();
        let api = self.api(descriptor, namespace.or(obj.namespace()));
        let res = api.replace(obj.name(), &PostParams::default(), &to_dynamic(obj)?).await;
        observe("update", started);
        from_dynamic(res.map_err(|e| map_err(descriptor, obj.name(), e))?)
    }

    async fn delete(&self, descriptor: &Descriptor, namespace: Option<&str>, name: &str, policy: PropagationPolicy) -> Result<()> {
        let started = Instant::now();
        let dp = DeleteParams {
            propagation_policy: Some(match policy {
                PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
                PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
                PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
            }),
            ..Default::default()
        };
        let res = self.api(descriptor, namespace).delete(name, &dp).await;
        observe("delete", started);
        res.map_err(|e| map_err(descriptor, name, e))?;
        debug!(kind = %descriptor.kind, name = %name, ns = ?namespace, ?policy, "delete accepted");
        Ok(())
    }

    async fn list(&self, descriptor: &Descriptor, namespace: Option<&str>, opts: &ListOptions) -> Result<Vec<Instance>> {
        let started = Instant::now();
        let mut lp = ListParams::default();
        if !opts.label_selector.is_empty() {
            lp = lp.labels(&opts.label_selector.to_string());
        }
        if !opts.field_selector.is_empty() {
            lp = lp.fields(&opts.field_selector.to_string());
        }
        let res = self.api(descriptor, namespace).list(&lp).await;
        observe("list", started);
        let list = res.map_err(|e| map_err(descriptor, "", e))?;
        list.items.into_iter().map(from_dynamic).collect()
    }
}

/// Namespace listing through the core/v1 Namespace API.
#[derive(Clone)]
pub struct KubeNamespaces {
    client: Client,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl NamespaceLister for KubeNamespaces {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Gateway(format!("listing namespaces: {e}")))?;
        let mut names: Vec<String> = list.items.into_iter().filter_map(|n| n.metadata.name).collect();
        names.sort();
        Ok(names)
    }
}

/// Discover served kinds (incl. CRDs) as runtime descriptors.
pub async fn discover(client: Client) -> Result<Vec<Descriptor>> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| Error::Gateway(format!("discovery: {e}")))?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(Descriptor {
                group: Cow::Owned(ar.group.clone()),
                version: Cow::Owned(ar.version.clone()),
                kind: Cow::Owned(ar.kind.clone()),
                resource: Cow::Owned(ar.plural.clone()),
                namespaced: matches!(caps.scope, Scope::Namespaced),
                friendly_name: Cow::Owned(ar.kind.clone()),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), "discovery finished");
    Ok(out)
}
