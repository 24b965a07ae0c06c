use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::policy::domain::{
    Action, Condition, Policy, PolicyContext, PolicyScope, StackingStrategy,
};
use crate::policy::engine::PolicyEngine;
use crate::policy::errors::SourceError;
use crate::policy::registry::{PolicyRegistry, PolicySource, RegistrySettings};
use crate::policy::source::InMemoryPolicySource;

pub(super) const TENANT: &str = "acme";
pub(super) const PURCHASE: &str = "purchase";

pub(super) fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn purchase(amount: i64) -> PolicyContext {
    PolicyContext::new("member-42", TENANT, PURCHASE, at(12))
        .with_amount(Decimal::from(amount))
        .with_transaction_id("txn-0001")
}

pub(super) fn gold_purchase(amount: i64) -> PolicyContext {
    purchase(amount).with_attribute("tier", "gold")
}

pub(super) fn scope() -> PolicyScope {
    PolicyScope::new(TENANT, &[PURCHASE])
}

pub(super) fn flat(id: &str, stacking: StackingStrategy, amount: i64) -> Policy {
    Policy::new(id, stacking, vec![Action::FlatBonus { amount }]).with_scope(scope())
}

pub(super) fn rate(id: &str, rate: Decimal) -> Policy {
    Policy::new(
        id,
        StackingStrategy::Additive,
        vec![Action::RatePerUnit { rate }],
    )
    .with_scope(scope())
}

pub(super) fn multiplier(id: &str, factor: Decimal) -> Policy {
    Policy::new(
        id,
        StackingStrategy::Multiplicative,
        vec![Action::Multiplier { factor }],
    )
    .with_scope(scope())
}

/// Gold-tier flat bonus of 50 plus an unconditional 2% earn rate.
pub(super) fn gold_and_earn_policies() -> Vec<Policy> {
    vec![
        flat("gold-bonus", StackingStrategy::Additive, 50)
            .with_condition(Condition::equals("tier", "gold")),
        rate("base-earn", Decimal::new(2, 2)),
    ]
}

pub(super) fn catalog(policies: Vec<Policy>) -> Arc<InMemoryPolicySource> {
    Arc::new(InMemoryPolicySource::with_policies(policies).expect("policies publish"))
}

pub(super) fn registry<S>(source: Arc<S>) -> Arc<PolicyRegistry<S>>
where
    S: PolicySource + 'static,
{
    Arc::new(PolicyRegistry::new(source, RegistrySettings::default()))
}

pub(super) fn engine_with(
    policies: Vec<Policy>,
) -> (
    Arc<PolicyEngine<InMemoryPolicySource>>,
    Arc<InMemoryPolicySource>,
) {
    let source = catalog(policies);
    let engine = Arc::new(PolicyEngine::new(registry(source.clone())));
    (engine, source)
}

pub(super) fn settings(ttl: Duration, fetch_timeout: Duration) -> RegistrySettings {
    RegistrySettings {
        cache_ttl: ttl,
        fetch_timeout,
    }
}

/// Source whose availability, latency and contents can be steered from a test.
#[derive(Default)]
pub(super) struct ControlledSource {
    policies: Mutex<Vec<Policy>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
}

impl ControlledSource {
    pub(super) fn with_policies(policies: Vec<Policy>) -> Self {
        let source = Self::default();
        source.replace(policies);
        source
    }

    pub(super) fn unavailable() -> Self {
        let source = Self::default();
        source.set_failing(true);
        source
    }

    pub(super) fn replace(&self, policies: Vec<Policy>) {
        *self.policies.lock().expect("policies mutex poisoned") = policies;
    }

    pub(super) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(super) fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicySource for ControlledSource {
    fn list_active_policies(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Policy>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("policy store offline".to_string()));
        }

        let policies = self.policies.lock().expect("policies mutex poisoned");
        Ok(policies
            .iter()
            .filter(|policy| policy.scope.matches(tenant_id, event_type))
            .cloned()
            .collect())
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
