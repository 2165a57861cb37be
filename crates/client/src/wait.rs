use std::time::{Duration, Instant};

use corral_core::{Condition, ConditionStatus, Error, Resource, Result};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Client;

/// Condition type most controllers report readiness through.
pub const READY: &str = "Ready";

/// Receives the watched condition whenever its status, reason or message changes.
pub type ConditionReporter<'a> = &'a (dyn Fn(&Condition) + Send + Sync);

/// Outcome of one poll of a wait condition.
#[derive(Debug)]
pub enum Wait<T> {
    Pending,
    Ready(T),
    Failed(Error),
}

/// Ok(true) when satisfied, Ok(false) when stale, missing or Unknown.
fn check_condition<K: Resource>(obj: &K, condition: &str) -> Result<bool> {
    if !obj.generation_current() {
        return Ok(false);
    }
    let Some(c) = obj.conditions().into_iter().find(|c| c.type_ == condition) else {
        return Ok(false);
    };
    match c.status {
        ConditionStatus::True => Ok(true),
        ConditionStatus::Unknown => Ok(false),
        ConditionStatus::False => Err(Error::ConditionFailed {
            condition: condition.to_string(),
            status: c.status.to_string(),
            reason: c.reason,
            message: c.message,
        }),
    }
}

impl<K: Resource> Client<K> {
    /// Poll `condition` with the result of each Get, starting immediately.
    pub async fn wait_for_e<T, F>(
        &self,
        namespace: Option<&str>,
        name: &str,
        interval: Duration,
        cancel: &CancellationToken,
        mut condition: F,
    ) -> Result<T>
    where
        F: FnMut(Result<K>) -> Wait<T> + Send,
        T: Send,
    {
        let started = Instant::now();
        let timed_out = || Error::Timeout(format!("waiting for {} {name:?} timed out", self.descriptor.friendly_name));
        loop {
            counter!("corral_wait_polls_total", 1u64);
            let got = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(timed_out()),
                got = self.get(namespace, name) => got,
            };
            match condition(got) {
                Wait::Ready(out) => {
                    histogram!("corral_wait_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                    return Ok(out);
                }
                Wait::Failed(e) => return Err(e),
                Wait::Pending => {}
            }
            debug!(kind = %self.descriptor.kind, name = %name, "still waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(timed_out()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Wait until `predicate` holds for the stored object. Get errors end the wait.
    pub async fn wait_for<P>(
        &self,
        namespace: Option<&str>,
        name: &str,
        interval: Duration,
        cancel: &CancellationToken,
        mut predicate: P,
    ) -> Result<K>
    where
        P: FnMut(&K) -> bool + Send,
    {
        self.wait_for_e(namespace, name, interval, cancel, |res| match res {
            Ok(obj) if predicate(&obj) => Wait::Ready(obj),
            Ok(_) => Wait::Pending,
            Err(e) => Wait::Failed(e),
        })
        .await
    }

    /// Wait until Get reports NotFound. Any other Get error is fatal.
    pub async fn wait_for_deletion(
        &self,
        namespace: Option<&str>,
        name: &str,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.wait_for_e(namespace, name, interval, cancel, |res| match res {
            Err(e) if e.is_not_found() => Wait::Ready(()),
            Err(e) => Wait::Failed(e),
            Ok(_) => Wait::Pending,
        })
        .await
    }

    /// Wait until `condition` is True for the current generation; False for
    /// the current generation fails at once.
    pub async fn wait_for_condition_true(
        &self,
        namespace: Option<&str>,
        name: &str,
        condition: &str,
        interval: Duration,
        cancel: &CancellationToken,
        reporter: Option<ConditionReporter<'_>>,
    ) -> Result<K> {
        let mut last: Option<(ConditionStatus, String, String)> = None;
        self.wait_for_e(namespace, name, interval, cancel, |res| {
            let obj = match res {
                Ok(obj) => obj,
                Err(e) => return Wait::Failed(e),
            };
            if let Some(report) = reporter {
                if let Some(c) = obj.conditions().into_iter().find(|c| c.type_ == condition) {
                    let seen = (c.status, c.reason.clone(), c.message.clone());
                    if last.as_ref() != Some(&seen) {
                        report(&c);
                        last = Some(seen);
                    }
                }
            }
            match check_condition(&obj, condition) {
                Ok(true) => Wait::Ready(obj),
                Ok(false) => Wait::Pending,
                Err(e) => Wait::Failed(e),
            }
        })
        .await
    }

    pub async fn wait_for_condition_ready_true(
        &self,
        namespace: Option<&str>,
        name: &str,
        interval: Duration,
        cancel: &CancellationToken,
        reporter: Option<ConditionReporter<'_>>,
    ) -> Result<K> {
        self.wait_for_condition_true(namespace, name, READY, interval, cancel, reporter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Descriptor, Instance};

    const APPS: Descriptor = Descriptor::new("apps", "v1", "Deployment", "deployments", true, "App");

    fn app(generation: i64, observed: i64, status: Option<ConditionStatus>) -> Instance {
        let mut obj = Instance::new(&APPS, Some("ns"), "web");
        obj.metadata.generation = generation;
        obj.set_observed_generation(observed).unwrap();
        if let Some(s) = status {
            obj.set_condition(Condition::new(READY, s).with_reason("Reconciling", "rolling out")).unwrap();
        }
        obj
    }

    #[test]
    fn stale_generation_is_never_ready() {
        assert!(!check_condition(&app(2, 1, Some(ConditionStatus::True)), READY).unwrap());
        assert!(!check_condition(&app(2, 1, Some(ConditionStatus::False)), READY).unwrap());
    }

    #[test]
    fn current_generation_follows_status() {
        assert!(check_condition(&app(2, 2, Some(ConditionStatus::True)), READY).unwrap());
        assert!(!check_condition(&app(2, 2, Some(ConditionStatus::Unknown)), READY).unwrap());
        assert!(!check_condition(&app(2, 2, None), READY).unwrap());
        let err = check_condition(&app(2, 2, Some(ConditionStatus::False)), READY).unwrap_err();
        assert_eq!(
            err.to_string(),
            "checking Ready failed, status: False message: rolling out reason: Reconciling"
        );
    }
}
