use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::policy::domain::{ActiveWindow, Policy, PolicyId, StackingStrategy};
use crate::policy::errors::RegistryError;
use crate::policy::registry::PolicyRegistry;

fn controlled(
    policies: Vec<Policy>,
    ttl: Duration,
) -> (Arc<ControlledSource>, PolicyRegistry<ControlledSource>) {
    let source = Arc::new(ControlledSource::with_policies(policies));
    let registry = PolicyRegistry::new(source.clone(), settings(ttl, Duration::from_millis(500)));
    (source, registry)
}

#[tokio::test]
async fn lookups_within_the_ttl_hit_the_cache() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::from_secs(60));

    let first = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    let second = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");

    assert_eq!(source.calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.cached_scopes(), 1);
}

#[tokio::test]
async fn expired_entries_are_refreshed_on_lookup() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::ZERO);

    let first = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    let second = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");

    assert_eq!(source.calls(), 2);
    assert!(second.generation() > first.generation());
}

#[tokio::test]
async fn scopes_are_cached_independently() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::from_secs(60));

    registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    let other = registry
        .snapshot("globex", PURCHASE)
        .await
        .expect("snapshot");

    assert_eq!(source.calls(), 2);
    assert!(other.policies().is_empty());
    assert_eq!(registry.cached_scopes(), 2);
}

#[tokio::test]
async fn invalidating_a_policy_marks_only_scopes_that_hold_it() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::from_secs(60));
    registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    registry.snapshot("globex", PURCHASE).await.expect("snapshot");

    assert_eq!(registry.invalidate(&PolicyId::from("gold-bonus")), 1);
    assert_eq!(registry.invalidate(&PolicyId::from("unknown")), 0);

    registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    registry.snapshot("globex", PURCHASE).await.expect("snapshot");
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn scope_and_full_invalidation_force_refetches() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::from_secs(60));
    registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    registry.snapshot(TENANT, "milestone").await.expect("snapshot");

    assert_eq!(registry.invalidate_scope(TENANT, "milestone"), 1);
    registry.snapshot(TENANT, "milestone").await.expect("snapshot");
    assert_eq!(source.calls(), 3);

    assert_eq!(registry.invalidate_all(), 2);
    registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    assert_eq!(source.calls(), 4);
}

#[tokio::test]
async fn stale_snapshot_is_served_when_the_source_fails() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::ZERO);
    let warm = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");

    source.set_failing(true);
    let fallback = registry.snapshot(TENANT, PURCHASE).await.expect("stale");

    assert_eq!(fallback.generation(), warm.generation());
    assert_eq!(fallback.policies().len(), 2);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn cold_cache_with_failing_source_is_unavailable() {
    let registry = PolicyRegistry::new(
        Arc::new(ControlledSource::unavailable()),
        settings(Duration::from_secs(60), Duration::from_millis(500)),
    );

    let outcome = registry.snapshot(TENANT, PURCHASE).await;

    match outcome {
        Err(RegistryError::Unavailable { detail, .. }) => {
            assert!(detail.contains("offline"));
        }
        Ok(_) => panic!("expected the registry to be unavailable"),
    }
}

#[tokio::test]
async fn slow_fetches_are_bounded_by_the_fetch_timeout() {
    let source = Arc::new(ControlledSource::with_policies(gold_and_earn_policies()));
    let registry = PolicyRegistry::new(
        source.clone(),
        settings(Duration::ZERO, Duration::from_millis(30)),
    );
    let warm = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");

    source.set_delay(Duration::from_millis(300));
    let fallback = registry.snapshot(TENANT, PURCHASE).await.expect("stale");
    assert_eq!(fallback.generation(), warm.generation());

    let cold = registry.snapshot(TENANT, "milestone").await;
    assert!(matches!(
        cold,
        Err(RegistryError::Unavailable { ref detail, .. }) if detail.contains("exceeded")
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_misses_share_one_fetch() {
    let (source, registry) = controlled(gold_and_earn_policies(), Duration::from_secs(60));
    source.set_delay(Duration::from_millis(50));
    let registry = Arc::new(registry);

    let lookups: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.snapshot(TENANT, PURCHASE).await })
        })
        .collect();

    let mut generations = Vec::new();
    for lookup in lookups {
        let snapshot = lookup.await.expect("lookup task").expect("snapshot");
        generations.push(snapshot.generation());
    }

    assert_eq!(source.calls(), 1);
    assert!(generations.iter().all(|generation| *generation == generations[0]));
    assert_eq!(registry.cached_scopes(), 1);
}

#[tokio::test]
async fn snapshots_order_by_precedence_then_id_and_filter_windows() {
    let windowed = flat("late-night", StackingStrategy::Additive, 5).with_window(ActiveWindow {
        starts_at: Some(at(22)),
        ends_at: None,
    });
    let (_, registry) = controlled(
        vec![
            flat("b-bonus", StackingStrategy::Additive, 1).with_precedence(1),
            flat("a-bonus", StackingStrategy::Additive, 1).with_precedence(1),
            flat("priority", StackingStrategy::Additive, 1).with_precedence(9),
            windowed,
        ],
        Duration::from_secs(60),
    );

    let snapshot = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    let ordered: Vec<&str> = snapshot
        .policies()
        .iter()
        .map(|policy| policy.id.as_str())
        .collect();
    assert_eq!(ordered, vec!["priority", "a-bonus", "b-bonus", "late-night"]);

    let candidates = registry.candidates(&purchase(10)).await.expect("candidates");
    assert_eq!(candidates.len(), 3);
    assert!(candidates.iter().all(|policy| policy.id.as_str() != "late-night"));
}

#[tokio::test]
async fn published_changes_reach_a_following_registry() {
    let catalog = catalog(vec![flat("welcome", StackingStrategy::Additive, 40)]);
    let registry = registry(catalog.clone());
    let follower = registry.follow_changes(catalog.subscribe());

    let before = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    assert_eq!(before.policies()[0].version, 1);

    let mut revised = flat("welcome", StackingStrategy::Additive, 90);
    revised.version = 2;
    catalog.publish(revised).expect("publish v2");

    let mut refreshed = None;
    for _ in 0..50 {
        let snapshot = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
        if snapshot.policies()[0].version == 2 {
            refreshed = Some(snapshot);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(refreshed.is_some(), "change notification never invalidated the cache");
    follower.abort();
}

#[tokio::test]
async fn newly_scoped_policies_invalidate_matching_scopes() {
    let catalog = catalog(Vec::new());
    let registry = registry(catalog.clone());
    let empty = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    assert!(empty.policies().is_empty());

    let change = catalog
        .publish(flat("welcome", StackingStrategy::Additive, 40))
        .expect("publish");
    assert_eq!(registry.invalidate_change(&change), 1);

    let snapshot = registry.snapshot(TENANT, PURCHASE).await.expect("snapshot");
    assert_eq!(snapshot.policies().len(), 1);
}
