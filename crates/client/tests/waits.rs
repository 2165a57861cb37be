#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corral_client::{DynamicClient, READY};
use corral_core::{
    Condition, ConditionStatus, Descriptor, Error, Gateway, Instance, ListOptions, PropagationPolicy, Result,
};
use corral_store::MemoryStore;
use tokio_util::sync::CancellationToken;

const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");
const TICK: Duration = Duration::from_millis(5);

/// Gateway that answers Get from a fixed script and counts calls.
struct Scripted {
    gets: Mutex<VecDeque<Result<Instance>>>,
    calls: Mutex<usize>,
}

impl Scripted {
    fn new(script: Vec<Result<Instance>>) -> Self {
        Self { gets: Mutex::new(script.into()), calls: Mutex::new(0) }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Gateway for Scripted {
    async fn create(&self, _: &Descriptor, _: Option<&str>, obj: &Instance) -> Result<Instance> {
        Ok(obj.clone())
    }

    async fn get(&self, d: &Descriptor, _: Option<&str>, name: &str) -> Result<Instance> {
        *self.calls.lock().unwrap() += 1;
        self.gets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Gateway(format!("script exhausted for {} {name}", d.kind))))
    }

    async fn update(&self, _: &Descriptor, _: Option<&str>, obj: &Instance) -> Result<Instance> {
        Ok(obj.clone())
    }

    async fn delete(&self, _: &Descriptor, _: Option<&str>, _: &str, _: PropagationPolicy) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _: &Descriptor, _: Option<&str>, _: &ListOptions) -> Result<Vec<Instance>> {
        Ok(Vec::new())
    }
}

fn app(status: Option<ConditionStatus>, current: bool) -> Instance {
    let mut obj = Instance::new(&APPS, Some("ns"), "web");
    obj.metadata.generation = 3;
    obj.set_observed_generation(if current { 3 } else { 2 }).unwrap();
    if let Some(s) = status {
        obj.set_condition(Condition::new(READY, s).with_reason("Rollout", "2 of 3 updated")).unwrap();
    }
    obj
}

#[tokio::test]
async fn ready_true_returns_on_first_get() {
    let gw = Arc::new(Scripted::new(vec![Ok(app(Some(ConditionStatus::True), true))]));
    let client = DynamicClient::with_descriptor(gw.clone(), APPS);
    let got = client
        .wait_for_condition_ready_true(Some("ns"), "web", Duration::from_secs(60), &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(got.name(), "web");
    assert_eq!(gw.calls(), 1);
}

#[tokio::test]
async fn ready_false_fails_immediately() {
    let gw = Arc::new(Scripted::new(vec![Ok(app(Some(ConditionStatus::False), true))]));
    let client = DynamicClient::with_descriptor(gw.clone(), APPS);
    let err = client
        .wait_for_condition_ready_true(Some("ns"), "web", Duration::from_secs(60), &CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConditionFailed { .. }));
    assert_eq!(gw.calls(), 1);
}

#[tokio::test]
async fn stale_and_unknown_keep_polling_and_report_changes() {
    let gw = Arc::new(Scripted::new(vec![
        Ok(app(None, true)),
        Ok(app(Some(ConditionStatus::False), false)),
        Ok(app(Some(ConditionStatus::Unknown), true)),
        Ok(app(Some(ConditionStatus::Unknown), true)),
        Ok(app(Some(ConditionStatus::True), true)),
    ]));
    let client = DynamicClient::with_descriptor(gw.clone(), APPS);
    let seen = Mutex::new(Vec::new());
    let report = |c: &Condition| seen.lock().unwrap().push(c.status);
    client
        .wait_for_condition_ready_true(Some("ns"), "web", TICK, &CancellationToken::new(), Some(&report))
        .await
        .unwrap();
    assert_eq!(gw.calls(), 5);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ConditionStatus::False, ConditionStatus::Unknown, ConditionStatus::True]
    );
}

#[tokio::test]
async fn deletion_wait_succeeds_after_not_found() {
    let gw = Arc::new(Scripted::new(vec![
        Ok(app(None, true)),
        Ok(app(None, true)),
        Err(Error::not_found("App", "web")),
    ]));
    let client = DynamicClient::with_descriptor(gw.clone(), APPS);
    client.wait_for_deletion(Some("ns"), "web", TICK, &CancellationToken::new()).await.unwrap();
    assert_eq!(gw.calls(), 3);
}

#[tokio::test]
async fn deletion_wait_fails_on_other_errors() {
    let gw = Arc::new(Scripted::new(vec![Ok(app(None, true)), Err(Error::Gateway("forbidden".into()))]));
    let client = DynamicClient::with_descriptor(gw, APPS);
    let err = client.wait_for_deletion(Some("ns"), "web", TICK, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Gateway(_)));
}

#[tokio::test]
async fn cancellation_ends_wait_with_timeout() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&APPS, Some("ns"), &app(Some(ConditionStatus::Unknown), true)).unwrap();
    let client = DynamicClient::with_descriptor(store, APPS);
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.cancel();
    });
    let err = client.wait_for(Some("ns"), "web", TICK, &cancel, |_| false).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "waiting for App \"web\" timed out");
}

/// Gateway whose Get never answers in time.
struct Stalled;

#[async_trait::async_trait]
impl Gateway for Stalled {
    async fn create(&self, _: &Descriptor, _: Option<&str>, obj: &Instance) -> Result<Instance> {
        Ok(obj.clone())
    }

    async fn get(&self, _: &Descriptor, _: Option<&str>, _: &str) -> Result<Instance> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(app(None, true))
    }

    async fn update(&self, _: &Descriptor, _: Option<&str>, obj: &Instance) -> Result<Instance> {
        Ok(obj.clone())
    }

    async fn delete(&self, _: &Descriptor, _: Option<&str>, _: &str, _: PropagationPolicy) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _: &Descriptor, _: Option<&str>, _: &ListOptions) -> Result<Vec<Instance>> {
        Ok(Vec::new())
    }
}

fn cancel_after(ms: u64) -> CancellationToken {
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        timer.cancel();
    });
    cancel
}

#[tokio::test]
async fn cancellation_interrupts_a_stalled_get() {
    let client = DynamicClient::with_descriptor(Arc::new(Stalled), APPS);
    let cancel = cancel_after(20);
    let started = std::time::Instant::now();
    let err = client.wait_for_deletion(Some("ns"), "web", TICK, &cancel).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn cancellation_interrupts_stalled_mutations() {
    let client = DynamicClient::with_descriptor(Arc::new(Stalled), APPS);
    let started = std::time::Instant::now();

    let err = client.transform(Some("ns"), "web", |_| Ok(()), &cancel_after(20)).await.unwrap_err();
    assert!(err.is_timeout());
    let err = client
        .upsert(Some("ns"), &app(None, true), |desired, _| desired.clone(), &cancel_after(20))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}
